use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Immutable configuration snapshot, built once from the environment at
/// startup and republished atomically by the live-update endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tracker_api_url: String,
    pub tracker_use_rest: bool,
    pub board_api_url: String,
    pub board_use_rest: bool,
    /// Periodic full-sync interval in milliseconds; 0 disables the timer.
    pub sync_interval_ms: u64,
    pub sync_parallel: bool,
    /// Bounded worker pool size, clamped to 1..=50.
    pub max_workers: usize,
    pub skip_empty_projects: bool,
    pub incremental_sync: bool,
    /// Optional pacing delay between external write calls, milliseconds.
    pub api_delay_ms: u64,
    pub dry_run: bool,
    pub agent: AgentConfig,
    /// Base directory scanned for project repositories.
    pub stacks_dir: PathBuf,
    pub health_port: u16,
    /// HMAC secret for the tracker webhook; absent means accept-and-warn.
    pub webhook_secret: Option<String>,
}

/// Agent platform section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub embedding: String,
    pub sync_tools_from_control: bool,
    pub sync_tools_force: bool,
    /// Name of the Control Agent serving as tool/persona template.
    pub control_name: String,
    pub attach_repo_docs: bool,
    /// Prefix for managed agent names: `<prefix>-<PROJ>-PM`.
    pub name_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: "openai/gpt-4o-mini".to_string(),
            embedding: "openai/text-embedding-3-small".to_string(),
            sync_tools_from_control: false,
            sync_tools_force: false,
            control_name: "Control-PM".to_string(),
            attach_repo_docs: true,
            name_prefix: "Sync".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker_api_url: String::new(),
            tracker_use_rest: true,
            board_api_url: String::new(),
            board_use_rest: true,
            sync_interval_ms: 30_000,
            sync_parallel: true,
            max_workers: 5,
            skip_empty_projects: true,
            incremental_sync: true,
            api_delay_ms: 0,
            dry_run: false,
            agent: AgentConfig::default(),
            stacks_dir: PathBuf::from("."),
            health_port: 8787,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing mandatory option: {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

impl Config {
    /// Build a config from the recognized environment options, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Config::default();
        let cfg = Self {
            tracker_api_url: env_str("TRACKER_API_URL").unwrap_or(d.tracker_api_url),
            tracker_use_rest: env_bool("TRACKER_USE_REST", d.tracker_use_rest)?,
            board_api_url: env_str("BOARD_API_URL").unwrap_or(d.board_api_url),
            board_use_rest: env_bool("BOARD_USE_REST", d.board_use_rest)?,
            sync_interval_ms: env_u64("SYNC_INTERVAL", d.sync_interval_ms)?,
            sync_parallel: env_bool("SYNC_PARALLEL", d.sync_parallel)?,
            max_workers: (env_u64("MAX_WORKERS", d.max_workers as u64)? as usize).clamp(1, 50),
            skip_empty_projects: env_bool("SKIP_EMPTY_PROJECTS", d.skip_empty_projects)?,
            incremental_sync: env_bool("INCREMENTAL_SYNC", d.incremental_sync)?,
            api_delay_ms: env_u64("API_DELAY", d.api_delay_ms)?,
            dry_run: env_bool("DRY_RUN", d.dry_run)?,
            agent: AgentConfig {
                base_url: env_str("AGENT_BASE_URL"),
                api_key: env_str("AGENT_API_KEY"),
                model: env_str("AGENT_MODEL").unwrap_or(d.agent.model),
                embedding: env_str("AGENT_EMBEDDING").unwrap_or(d.agent.embedding),
                sync_tools_from_control: env_bool(
                    "AGENT_SYNC_TOOLS_FROM_CONTROL",
                    d.agent.sync_tools_from_control,
                )?,
                sync_tools_force: env_bool("AGENT_SYNC_TOOLS_FORCE", d.agent.sync_tools_force)?,
                control_name: env_str("AGENT_CONTROL_NAME").unwrap_or(d.agent.control_name),
                attach_repo_docs: env_bool("AGENT_ATTACH_REPO_DOCS", d.agent.attach_repo_docs)?,
                name_prefix: d.agent.name_prefix,
            },
            stacks_dir: env_str("STACKS_DIR").map(PathBuf::from).unwrap_or(d.stacks_dir),
            health_port: env_u64("HEALTH_PORT", d.health_port as u64)? as u16,
            webhook_secret: env_str("WEBHOOK_SECRET"),
        };
        Ok(cfg)
    }

    /// Startup validation: mis-configured mandatory URLs are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracker_api_url.is_empty() {
            return Err(ConfigError::Missing("TRACKER_API_URL"));
        }
        if self.board_api_url.is_empty() {
            return Err(ConfigError::Missing("BOARD_API_URL"));
        }
        Ok(())
    }

    /// Whether the agent platform integration is configured at all.
    pub fn agent_enabled(&self) -> bool {
        self.agent.base_url.is_some()
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::Invalid(key, other.to_string())),
        },
    }
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(key, v)),
    }
}

// ---------------------------------------------------------------------------
// Live updates
// ---------------------------------------------------------------------------

/// Subset of options the control endpoint may change at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub sync_interval_ms: Option<u64>,
    pub max_workers: Option<usize>,
    pub sync_parallel: Option<bool>,
    pub skip_empty_projects: Option<bool>,
    pub incremental_sync: Option<bool>,
    pub dry_run: Option<bool>,
}

/// Handle publishing immutable config snapshots. Timers and workers hold a
/// `watch::Receiver` and observe each new snapshot atomically.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Subscribe for change notifications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Apply a live patch, producing and publishing a new snapshot.
    pub fn apply(&self, patch: &ConfigPatch) {
        let mut next = (*self.current()).clone();
        if let Some(v) = patch.sync_interval_ms {
            next.sync_interval_ms = v;
        }
        if let Some(v) = patch.max_workers {
            next.max_workers = v.clamp(1, 50);
        }
        if let Some(v) = patch.sync_parallel {
            next.sync_parallel = v;
        }
        if let Some(v) = patch.skip_empty_projects {
            next.skip_empty_projects = v;
        }
        if let Some(v) = patch.incremental_sync {
            next.incremental_sync = v;
        }
        if let Some(v) = patch.dry_run {
            next.dry_run = v;
        }
        self.tx.send_replace(Arc::new(next));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.sync_interval_ms, 30_000);
        assert_eq!(c.max_workers, 5);
        assert!(c.skip_empty_projects);
        assert!(!c.dry_run);
        assert_eq!(c.agent.name_prefix, "Sync");
    }

    #[test]
    fn validate_requires_urls() {
        let mut c = Config::default();
        assert!(matches!(c.validate(), Err(ConfigError::Missing("TRACKER_API_URL"))));
        c.tracker_api_url = "http://tracker.local".into();
        assert!(matches!(c.validate(), Err(ConfigError::Missing("BOARD_API_URL"))));
        c.board_api_url = "http://board.local".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn patch_applies_and_clamps() {
        let handle = ConfigHandle::new(Config::default());
        handle.apply(&ConfigPatch {
            sync_interval_ms: Some(5_000),
            max_workers: Some(500),
            dry_run: Some(true),
            ..Default::default()
        });
        let snap = handle.current();
        assert_eq!(snap.sync_interval_ms, 5_000);
        assert_eq!(snap.max_workers, 50); // clamped
        assert!(snap.dry_run);
        // Untouched fields survive.
        assert!(snap.skip_empty_projects);
    }

    #[test]
    fn subscribers_observe_new_snapshot() {
        let handle = ConfigHandle::new(Config::default());
        let rx = handle.subscribe();
        handle.apply(&ConfigPatch {
            max_workers: Some(2),
            ..Default::default()
        });
        assert_eq!(rx.borrow().max_workers, 2);
    }
}
