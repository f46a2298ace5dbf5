//! Agent lifecycle management: one primary agent per project, matching the
//! desired name, tags, memory blocks, tool set, and documentation folder.
//!
//! The manager is deliberately quiet: block writes are suppressed by content
//! hash, tool operations are paced, and a single failing block or tool marks
//! the batch as a partial failure instead of aborting the project.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vs_clients::platform::{
    AgentApiError, AgentQuery, CreateAgent, MemoryBlock, NewBlock, PlatformAgent,
    PlatformClient, Tool,
};
use vs_core::hash::content_hash;
use vs_core::store::{StateStore, StoreError};
use vs_core::types::{AgentBinding, Project};

use crate::blocks::{self, SCRATCHPAD_LABEL};

/// Suffix marking a background (sleep-time) agent. The sync engine never
/// binds a project to one of these.
pub const SLEEPTIME_SUFFIX: &str = "-sleeptime";

/// Minimum spacing between tool attach/detach operations per agent.
const TOOL_OP_DELAY: Duration = Duration::from_millis(200);

/// Concurrent block updates per agent, to avoid transactional conflicts on
/// the platform.
const BLOCK_CONCURRENCY: usize = 2;

// ---------------------------------------------------------------------------
// Errors & outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("platform error: {0}")]
    Api(#[from] AgentApiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// What one agent pass actually did. Block errors are collected rather than
/// fatal; callers report them as a partial failure.
#[derive(Debug, Clone, Default)]
pub struct AgentSyncOutcome {
    pub agent_id: String,
    pub agent_created: bool,
    pub blocks_written: u32,
    pub blocks_skipped: u32,
    pub block_errors: Vec<(String, String)>,
    pub tools_attached: u32,
    pub tools_detached: u32,
    pub docs_uploaded: u32,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// `<prefix>-<PROJ>-PM`.
    pub name_prefix: String,
    /// Tag carried by every managed agent.
    pub service_tag: String,
    /// Name of the Control Agent template. Never managed as a project agent.
    pub control_name: String,
    pub sync_tools_from_control: bool,
    pub sync_tools_force: bool,
    pub attach_repo_docs: bool,
    pub model: String,
    pub embedding: String,
    pub dry_run: bool,
    /// TTL for the cached Control Agent tool list (one sync interval).
    pub control_tools_ttl: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            name_prefix: "Sync".to_string(),
            service_tag: "vibe-sync".to_string(),
            control_name: "Control-PM".to_string(),
            sync_tools_from_control: false,
            sync_tools_force: false,
            attach_repo_docs: true,
            model: "openai/gpt-4o-mini".to_string(),
            embedding: "openai/text-embedding-3-small".to_string(),
            dry_run: false,
            control_tools_ttl: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct AgentLifecycleManager {
    platform: Arc<PlatformClient>,
    store: Arc<StateStore>,
    config: LifecycleConfig,
    control_tools: Mutex<Option<(Instant, Vec<Tool>)>>,
}

impl AgentLifecycleManager {
    pub fn new(
        platform: Arc<PlatformClient>,
        store: Arc<StateStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            platform,
            store,
            config,
            control_tools: Mutex::new(None),
        }
    }

    pub fn agent_name(&self, project_identifier: &str) -> String {
        format!("{}-{}-PM", self.config.name_prefix, project_identifier)
    }

    fn sleeptime_name(&self, project_identifier: &str) -> String {
        format!("{}{}", self.agent_name(project_identifier), SLEEPTIME_SUFFIX)
    }

    fn project_tag(project_identifier: &str) -> String {
        format!("project:{project_identifier}")
    }

    fn is_sleeptime(name: &str) -> bool {
        name.ends_with(SLEEPTIME_SUFFIX)
    }

    /// Run the whole agent phase for one project: ensure the primary agent,
    /// upsert memory blocks, sync tools, upload docs, persist the binding.
    pub async fn sync_project_agent(
        &self,
        project: &Project,
        block_values: &[(String, String)],
    ) -> Result<AgentSyncOutcome> {
        if self.config.dry_run {
            info!(project = %project.identifier, "dry run: skipping agent sync");
            return Ok(AgentSyncOutcome::default());
        }

        let mut outcome = AgentSyncOutcome::default();

        let (agent, created) = self.ensure_agent(project, block_values).await?;
        outcome.agent_id = agent.id.clone();
        outcome.agent_created = created;

        let (written, skipped, errors) = self
            .upsert_blocks(&agent.id, &project.identifier, block_values)
            .await?;
        outcome.blocks_written = written;
        outcome.blocks_skipped = skipped;
        outcome.block_errors = errors;

        if let Err(e) = self.constrain_sleeptime_partner(&project.identifier).await {
            warn!(project = %project.identifier, error = %e,
                  "failed to constrain sleep-time partner");
        }

        if self.config.sync_tools_from_control {
            match self.sync_tools(&agent.id).await {
                Ok((attached, detached)) => {
                    outcome.tools_attached = attached;
                    outcome.tools_detached = detached;
                }
                Err(e) => warn!(project = %project.identifier, error = %e, "tool sync failed"),
            }
        }

        let mut binding = AgentBinding::new(&project.identifier, &agent.id);
        if self.config.attach_repo_docs {
            match self.upload_project_docs(project, &mut binding).await {
                Ok(count) => outcome.docs_uploaded = count,
                Err(e) => warn!(project = %project.identifier, error = %e, "doc upload failed"),
            }
        }

        binding.agent_last_sync_at = Some(chrono::Utc::now());
        self.store.upsert_binding(&binding).await?;

        if let Some(path) = &project.filesystem_path {
            if let Err(e) = mirror_settings(Path::new(path), &agent.id).await {
                warn!(project = %project.identifier, error = %e,
                      "failed to mirror agent id into settings.local.json");
            }
        }

        Ok(outcome)
    }

    /// Drop the platform client's agent-scoped caches. The orchestrator
    /// calls this at the end of every sync run.
    pub fn clear_platform_caches(&self) {
        self.platform.clear_agent_caches();
    }

    /// Re-run only the documentation upload for a project, used by the docs
    /// watcher (a doc change does not warrant a full sync). Returns the
    /// number of files uploaded.
    pub async fn refresh_project_docs(&self, project: &Project) -> Result<u32> {
        if self.config.dry_run || !self.config.attach_repo_docs {
            return Ok(0);
        }
        let Some(existing) = self.store.get_binding(&project.identifier).await? else {
            // No agent yet; the next full sync will create one and upload.
            return Ok(0);
        };
        let mut binding = existing;
        let uploaded = self.upload_project_docs(project, &mut binding).await?;
        self.store.upsert_binding(&binding).await?;
        Ok(uploaded)
    }

    // -----------------------------------------------------------------------
    // Agent ensure
    // -----------------------------------------------------------------------

    /// Ensure exactly one primary agent exists for the project and return
    /// it. Returns `(agent, created)`.
    async fn ensure_agent(
        &self,
        project: &Project,
        block_values: &[(String, String)],
    ) -> Result<(PlatformAgent, bool)> {
        let name = self.agent_name(&project.identifier);
        let tags = vec![
            self.config.service_tag.clone(),
            Self::project_tag(&project.identifier),
        ];

        // 1. A bound agent that still exists and is not sleep-time wins.
        if let Some(binding) = self.store.get_binding(&project.identifier).await? {
            match self.platform.get_agent(&binding.agent_id).await {
                Ok(agent) if !Self::is_sleeptime(&agent.name) => {
                    self.cleanup_duplicates(&agent.id, &name, &tags).await;
                    return Ok((agent, false));
                }
                Ok(agent) => {
                    warn!(project = %project.identifier, agent = %agent.name,
                          "binding points at a sleep-time agent, discarding");
                    self.store.delete_binding(&project.identifier).await?;
                }
                Err(AgentApiError::Http(404)) => {
                    warn!(project = %project.identifier, agent_id = %binding.agent_id,
                          "bound agent deleted at platform, resurrecting");
                    self.store.delete_binding(&project.identifier).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // 2. Search by name and by tags; adopt a surviving primary.
        let candidates = self.find_candidates(&name, &tags).await?;
        let primaries: Vec<&PlatformAgent> = candidates
            .iter()
            .filter(|a| !Self::is_sleeptime(&a.name))
            .collect();
        if let Some(keep) = pick_primary(&primaries) {
            let keep = keep.clone();
            self.cleanup_duplicates(&keep.id, &name, &tags).await;
            self.store
                .upsert_binding(&AgentBinding::new(&project.identifier, &keep.id))
                .await?;
            info!(project = %project.identifier, agent_id = %keep.id, "adopted existing agent");
            return Ok((keep, false));
        }

        // 3. Create a fresh primary, seeding persona/human from the Control
        //    Agent template when one exists.
        let memory_blocks = self.initial_blocks(project, block_values).await;
        let agent = self
            .platform
            .create_agent(&CreateAgent {
                name: name.clone(),
                tags,
                model: self.config.model.clone(),
                embedding: self.config.embedding.clone(),
                memory_blocks,
            })
            .await?;
        info!(project = %project.identifier, agent_id = %agent.id, "created project agent");

        self.store
            .upsert_binding(&AgentBinding::new(&project.identifier, &agent.id))
            .await?;
        Ok((agent, true))
    }

    async fn find_candidates(&self, name: &str, tags: &[String]) -> Result<Vec<PlatformAgent>> {
        let mut candidates = self.platform.list_agents(&AgentQuery::by_name(name)).await?;
        let tagged = self
            .platform
            .list_agents(&AgentQuery::by_tags(tags.to_vec(), true))
            .await?;
        for agent in tagged {
            if !candidates.iter().any(|a| a.id == agent.id) {
                candidates.push(agent);
            }
        }
        Ok(candidates)
    }

    /// Delete every primary with our canonical name except `keep_id`.
    /// Best-effort: a failed delete is logged, not fatal.
    async fn cleanup_duplicates(&self, keep_id: &str, name: &str, tags: &[String]) {
        let candidates = match self.find_candidates(name, tags).await {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "duplicate sweep listing failed");
                return;
            }
        };
        for agent in candidates {
            if agent.id != keep_id && agent.name == name && !Self::is_sleeptime(&agent.name) {
                warn!(agent_id = %agent.id, name, "deleting duplicate primary agent");
                if let Err(e) = self.platform.delete_agent(&agent.id).await {
                    warn!(agent_id = %agent.id, error = %e, "failed to delete duplicate");
                }
            }
        }
    }

    /// Initial block set for a new agent: the computed values, with persona
    /// and human taken from the Control Agent when available and a scratchpad
    /// seed.
    async fn initial_blocks(
        &self,
        project: &Project,
        block_values: &[(String, String)],
    ) -> Vec<NewBlock> {
        let mut values: Vec<(String, String)> = block_values.to_vec();

        if let Ok(Some(control)) = self.control_agent().await {
            if let Ok(control_blocks) = self.platform.list_blocks(&control.id).await {
                for label in ["persona", "human"] {
                    if let Some(template) =
                        control_blocks.iter().find(|b| b.label == label)
                    {
                        set_block_value(&mut values, label, &template.value);
                    }
                }
            }
        }
        if !values.iter().any(|(l, _)| l == "persona") {
            values.push(("persona".to_string(), blocks::persona_block(project)));
        }
        if !values.iter().any(|(l, _)| l == "human") {
            values.push(("human".to_string(), blocks::human_block(project)));
        }
        if !values.iter().any(|(l, _)| l == SCRATCHPAD_LABEL) {
            values.push((SCRATCHPAD_LABEL.to_string(), blocks::scratchpad_block()));
        }

        values
            .into_iter()
            .map(|(label, value)| NewBlock { label, value })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Block upsert
    // -----------------------------------------------------------------------

    /// Hash-suppressed block upsert with a bounded number of in-flight
    /// updates. Returns `(written, skipped, errors)`.
    async fn upsert_blocks(
        &self,
        agent_id: &str,
        project_identifier: &str,
        block_values: &[(String, String)],
    ) -> Result<(u32, u32, Vec<(String, String)>)> {
        let persisted = self.store.get_block_hashes(project_identifier).await?;

        // Pass 1: drop everything whose hash matches the cache (or the
        // persisted hash) without touching the network.
        let mut skipped: u32 = 0;
        let mut misses: Vec<(String, String, String)> = Vec::new(); // label, value, hash
        for (label, value) in block_values {
            let new_hash = content_hash(value);
            let cached = self
                .platform
                .cached_block_hash(agent_id, label)
                .or_else(|| persisted.get(label).cloned());
            if cached.as_deref() == Some(new_hash.as_str()) {
                self.platform.remember_block_hash(agent_id, label, &new_hash);
                skipped += 1;
                continue;
            }
            misses.push((label.clone(), value.clone(), new_hash));
        }

        if misses.is_empty() {
            return Ok((0, skipped, Vec::new()));
        }

        // Pass 2: one fetch of the agent's live blocks; values already equal
        // remotely become cache-only updates.
        let remote = self.platform.list_blocks(agent_id).await?;
        let mut to_write: Vec<(String, String, String)> = Vec::new();
        for (label, value, new_hash) in misses {
            let remote_block = remote.iter().find(|b| b.label == label);
            match remote_block {
                Some(b) if content_hash(&b.value) == new_hash => {
                    self.platform.remember_block_hash(agent_id, &label, &new_hash);
                    self.store
                        .set_block_hash(project_identifier, &label, &new_hash)
                        .await?;
                    skipped += 1;
                }
                // The agent owns its scratchpad once it exists.
                Some(_) if label == SCRATCHPAD_LABEL => {
                    skipped += 1;
                }
                _ => to_write.push((label, value, new_hash)),
            }
        }

        // Pass 3: bounded-concurrency writes; failures collected per label.
        let results: Vec<(String, String, std::result::Result<MemoryBlock, AgentApiError>)> =
            stream::iter(to_write)
                .map(|(label, value, new_hash)| {
                    let platform = Arc::clone(&self.platform);
                    let agent_id = agent_id.to_string();
                    async move {
                        let res = platform.modify_block(&agent_id, &label, &value).await;
                        (label, new_hash, res)
                    }
                })
                .buffer_unordered(BLOCK_CONCURRENCY)
                .collect()
                .await;

        let mut written: u32 = 0;
        let mut errors = Vec::new();
        for (label, new_hash, res) in results {
            match res {
                Ok(_) => {
                    self.platform.remember_block_hash(agent_id, &label, &new_hash);
                    self.store
                        .set_block_hash(project_identifier, &label, &new_hash)
                        .await?;
                    written += 1;
                }
                Err(e) => {
                    warn!(agent_id, label = %label, error = %e, "block upsert failed");
                    errors.push((label, e.to_string()));
                }
            }
        }
        Ok((written, skipped, errors))
    }

    // -----------------------------------------------------------------------
    // Sleep-time partner
    // -----------------------------------------------------------------------

    /// If the project has a sleep-time partner agent, constrain its attached
    /// memory to the scratchpad block only.
    async fn constrain_sleeptime_partner(&self, project_identifier: &str) -> Result<()> {
        let partner_name = self.sleeptime_name(project_identifier);
        let found = self
            .platform
            .list_agents(&AgentQuery::by_name(&partner_name))
            .await?;
        let Some(partner) = found.into_iter().find(|a| a.name == partner_name) else {
            return Ok(());
        };

        let attached = self.platform.list_blocks(&partner.id).await?;
        for block in attached {
            if block.label != SCRATCHPAD_LABEL {
                debug!(partner = %partner.id, label = %block.label,
                       "detaching non-scratchpad block from sleep-time partner");
                self.platform.detach_block(&partner.id, &block.id).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Control Agent tool sync
    // -----------------------------------------------------------------------

    async fn control_agent(&self) -> Result<Option<PlatformAgent>> {
        let found = self
            .platform
            .list_agents(&AgentQuery::by_name(&self.config.control_name))
            .await?;
        Ok(found
            .into_iter()
            .find(|a| a.name == self.config.control_name))
    }

    async fn control_tool_list(&self, control_id: &str) -> Result<Vec<Tool>> {
        let mut cache = self.control_tools.lock().await;
        if let Some((fetched_at, tools)) = cache.as_ref() {
            if fetched_at.elapsed() < self.config.control_tools_ttl {
                return Ok(tools.clone());
            }
        }
        let tools = self.platform.list_agent_tools(control_id).await?;
        *cache = Some((Instant::now(), tools.clone()));
        Ok(tools)
    }

    /// Align the agent's tool set with the Control Agent. Additive mode only
    /// attaches what is missing; force mode also detaches extras. Operations
    /// are paced at >= 200 ms apart.
    async fn sync_tools(&self, agent_id: &str) -> Result<(u32, u32)> {
        let Some(control) = self.control_agent().await? else {
            warn!(control = %self.config.control_name, "control agent not found, skipping tool sync");
            return Ok((0, 0));
        };
        if control.id == agent_id {
            // The Control Agent is the template, never a managed target.
            return Ok((0, 0));
        }

        let desired = self.control_tool_list(&control.id).await?;
        let current = self.platform.list_agent_tools(agent_id).await?;

        let mut attached: u32 = 0;
        let mut detached: u32 = 0;
        let mut first_op = true;

        for tool in &desired {
            if !current.iter().any(|t| t.name == tool.name) {
                if !first_op {
                    tokio::time::sleep(TOOL_OP_DELAY).await;
                }
                first_op = false;
                self.platform.attach_tool(agent_id, &tool.id).await?;
                attached += 1;
            }
        }

        if self.config.sync_tools_force {
            for tool in &current {
                if !desired.iter().any(|t| t.name == tool.name) {
                    if !first_op {
                        tokio::time::sleep(TOOL_OP_DELAY).await;
                    }
                    first_op = false;
                    self.platform.detach_tool(agent_id, &tool.id).await?;
                    detached += 1;
                }
            }
        }

        if attached > 0 || detached > 0 {
            info!(agent_id, attached, detached, "tool sync applied");
        }
        Ok((attached, detached))
    }

    // -----------------------------------------------------------------------
    // Documentation upload
    // -----------------------------------------------------------------------

    /// Upload README-like files from the project root into its folder,
    /// suppressed per file by content hash. Fills the binding's folder and
    /// source ids.
    async fn upload_project_docs(
        &self,
        project: &Project,
        binding: &mut AgentBinding,
    ) -> Result<u32> {
        let Some(path) = &project.filesystem_path else {
            return Ok(0);
        };
        let root = Path::new(path);
        if !root.is_dir() {
            return Ok(0);
        }

        let folder = self.platform.ensure_folder(&project.identifier).await?;
        binding.folder_id = Some(folder.id.clone());

        let source = self
            .platform
            .ensure_source(&format!("{}-docs", project.identifier), &self.config.embedding)
            .await?;
        if source.is_placeholder() {
            debug!(project = %project.identifier, "source unresolved, skipping doc upload");
            return Ok(0);
        }
        binding.source_id = Some(source.id.clone());

        let mut uploaded: u32 = 0;
        for filename in readme_like_files(root).await? {
            let content = tokio::fs::read_to_string(root.join(&filename)).await?;
            let hash = content_hash(&content);
            let key = format!("doc:{filename}");
            let persisted = self.store.get_block_hashes(&project.identifier).await?;
            if persisted.get(&key).map(String::as_str) == Some(hash.as_str()) {
                continue;
            }
            self.platform.upload_file(&folder.id, &filename, &content).await?;
            self.store
                .set_block_hash(&project.identifier, &key, &hash)
                .await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }
}

/// Pick the survivor among duplicate primaries: the most recently created
/// (RFC 3339 strings order correctly), falling back to the highest id.
fn pick_primary(primaries: &[&PlatformAgent]) -> Option<PlatformAgent> {
    primaries
        .iter()
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|a| (*a).clone())
}

fn set_block_value(values: &mut Vec<(String, String)>, label: &str, value: &str) {
    if let Some(entry) = values.iter_mut().find(|(l, _)| l == label) {
        entry.1 = value.to_string();
    } else {
        values.push((label.to_string(), value.to_string()));
    }
}

/// Top-level README-like files: markdown/text files whose name starts with
/// `README` case-insensitively.
async fn readme_like_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut dir = tokio::fs::read_dir(root).await?;
    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.to_uppercase().starts_with("README") {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}

/// Mirror the agent id into `<path>/.state/settings.local.json`, preserving
/// any other keys already in the file.
async fn mirror_settings(project_path: &Path, agent_id: &str) -> std::io::Result<()> {
    let dir = project_path.join(".state");
    tokio::fs::create_dir_all(&dir).await?;
    let file = dir.join("settings.local.json");

    let mut settings: serde_json::Value = match tokio::fs::read_to_string(&file).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({})),
        Err(_) => serde_json::json!({}),
    };
    settings["lastAgent"] = serde_json::Value::String(agent_id.to_string());

    let pretty = serde_json::to_string_pretty(&settings).unwrap_or_default();
    tokio::fs::write(&file, pretty).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
