use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// Lifecycle state of a project. `Empty` projects are skipped by the
/// orchestrator until their cache entry expires or a change event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    #[default]
    Active,
    Empty,
}

/// A canonical project, keyed by its short UPPERCASE identifier (the tracker
/// project key, e.g. `ACME`). Created on first observation in any source and
/// retained until deleted in all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub identifier: String,
    pub name: String,
    pub tracker_id: Option<String>,
    pub board_id: Option<String>,
    pub filesystem_path: Option<String>,
    pub git_url: Option<String>,
    pub description_hash: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub issue_count: u32,
    pub state: ProjectState,
}

impl Project {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            tracker_id: None,
            board_id: None,
            filesystem_path: None,
            git_url: None,
            description_hash: None,
            last_sync_at: None,
            issue_count: 0,
            state: ProjectState::Active,
        }
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// A canonical issue. The tracker identifier (`PROJ-NNN`) is the immutable
/// natural key; board and local-store ids are attributes bound as each source
/// discovers the issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub identifier: String,
    pub project_identifier: String,
    pub title: String,
    pub description: Option<String>,
    /// Canonical tracker-side status label (e.g. `In Progress`).
    pub status: String,
    pub priority: Option<String>,
    pub tracker_id: Option<String>,
    pub board_task_id: Option<String>,
    pub local_store_id: Option<String>,
    /// Last-observed status per source.
    pub tracker_status: Option<String>,
    pub board_status: Option<String>,
    pub local_status: Option<String>,
    /// Last-observed modification time per source.
    pub tracker_modified_at: Option<DateTime<Utc>>,
    pub board_modified_at: Option<DateTime<Utc>>,
    pub local_modified_at: Option<DateTime<Utc>>,
    pub description_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(
        identifier: impl Into<String>,
        project_identifier: impl Into<String>,
        title: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            project_identifier: project_identifier.into(),
            title: title.into(),
            description: None,
            status: status.into(),
            priority: None,
            tracker_id: None,
            board_task_id: None,
            local_store_id: None,
            tracker_status: None,
            board_status: None,
            local_status: None,
            tracker_modified_at: None,
            board_modified_at: None,
            local_modified_at: None,
            description_hash: None,
            updated_at: Utc::now(),
        }
    }
}

/// Normalize a title for `(project, title)` matching: trimmed, lowercased,
/// inner whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ---------------------------------------------------------------------------
// Agent binding
// ---------------------------------------------------------------------------

/// Per-project binding to the project's memory agent on the platform.
/// `agent_id` always refers to a primary agent, never a sleep-time one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinding {
    pub project_identifier: String,
    pub agent_id: String,
    pub folder_id: Option<String>,
    pub source_id: Option<String>,
    pub agent_last_sync_at: Option<DateTime<Utc>>,
}

impl AgentBinding {
    pub fn new(project_identifier: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            project_identifier: project_identifier.into(),
            agent_id: agent_id.into(),
            folder_id: None,
            source_id: None,
            agent_last_sync_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync run
// ---------------------------------------------------------------------------

/// One append-only record per sync run, used by the health endpoint and for
/// post-hoc debugging. Errors are keyed by project identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub projects_processed: u32,
    pub projects_failed: u32,
    pub issues_synced: u32,
    pub errors: BTreeMap<String, String>,
    pub duration_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Divergence report
// ---------------------------------------------------------------------------

/// One three-way status disagreement found by the periodic reconciliation
/// pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
    pub issue_identifier: String,
    pub project_identifier: String,
    pub tracker_status: Option<String>,
    pub board_status: Option<String>,
    pub local_status: Option<String>,
}

/// Output of the periodic full reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub projects_checked: u32,
    pub divergences: Vec<Divergence>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
