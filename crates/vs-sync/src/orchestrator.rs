//! Per-project reconciliation across the tracker, the board, and the local
//! issue store, followed by the agent phase.
//!
//! Phases run in order under the project's mutex: discover, tracker->board,
//! board->tracker, tracker<->local, agent. Store writes are batched; after a
//! successful reconciliation every per-source status/timestamp column holds
//! the *observed* value from the source's response, never the value we
//! intended to write.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vs_agents::blocks::{self, ChangeLogEntry};
use vs_agents::{AgentLifecycleManager, LifecycleError};
use vs_clients::board::{BoardClient, BoardError, BoardTask, CreateTask, TaskPatch};
use vs_clients::localstore::{LocalStoreAdapter, LocalStoreError};
use vs_clients::tracker::{TrackerClient, TrackerError};
use vs_core::config::ConfigHandle;
use vs_core::hash::content_hash;
use vs_core::mutexes::ProjectMutexes;
use vs_core::status::{board_to_tracker, canonical_tracker, tracker_to_board, BoardStatus};
use vs_core::store::{StateStore, StoreError};
use vs_core::types::{
    normalize_title, Divergence, DivergenceReport, Issue, Project, ProjectState,
};

use crate::conflict::{resolve_status, ConflictPolicy, FlapGuard, Winner};

/// Description footer cross-referencing a board task back to its tracker
/// issue. Bit-exact contract; always on its own line.
pub const FOOTER_PREFIX: &str = "Huly Issue:";
/// Accepted alternate footer spelling on inbound descriptions.
pub const FOOTER_ALT_PREFIX: &str = "Synced from Huly:";

const CHANGE_LOG_CAP: usize = 50;

fn empty_project_ttl() -> Duration {
    Duration::hours(1)
}

// ---------------------------------------------------------------------------
// Errors & reports
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("tracker: {0}")]
    Tracker(#[from] TrackerError),
    #[error("board: {0}")]
    Board(#[from] BoardError),
    #[error("local store: {0}")]
    Local(#[from] LocalStoreError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("agent lifecycle: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("cancelled")]
    Cancelled,
}

/// Aggregate result of one full sync run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub projects_processed: u32,
    pub projects_failed: u32,
    pub issues_synced: u32,
    /// Per-project failure messages, keyed by identifier.
    pub errors: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Footer helpers
// ---------------------------------------------------------------------------

/// The canonical footer line for a tracker identifier.
pub fn footer_line(identifier: &str) -> String {
    format!("{FOOTER_PREFIX} {identifier}")
}

/// Extract the tracker identifier from a task description footer, accepting
/// both footer spellings. The last matching line wins.
pub fn extract_footer_identifier(description: &str) -> Option<String> {
    for line in description.lines().rev() {
        let line = line.trim();
        for prefix in [FOOTER_PREFIX, FOOTER_ALT_PREFIX] {
            if let Some(rest) = line.strip_prefix(prefix) {
                let ident = rest.trim();
                if !ident.is_empty() {
                    return Some(ident.to_string());
                }
            }
        }
    }
    None
}

fn is_terminal(status: &str) -> bool {
    matches!(canonical_tracker(status), "Done" | "Cancelled")
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator {
    store: Arc<StateStore>,
    tracker: Arc<TrackerClient>,
    board: Arc<BoardClient>,
    local: Arc<LocalStoreAdapter>,
    agents: Option<Arc<AgentLifecycleManager>>,
    config: ConfigHandle,
    mutexes: ProjectMutexes,
    policy: ConflictPolicy,
    flap: Mutex<FlapGuard>,
    change_log: Mutex<HashMap<String, Vec<ChangeLogEntry>>>,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        tracker: Arc<TrackerClient>,
        board: Arc<BoardClient>,
        local: Arc<LocalStoreAdapter>,
        agents: Option<Arc<AgentLifecycleManager>>,
        config: ConfigHandle,
        mutexes: ProjectMutexes,
    ) -> Self {
        Self {
            store,
            tracker,
            board,
            local,
            agents,
            config,
            mutexes,
            policy: ConflictPolicy::default(),
            flap: Mutex::new(FlapGuard::new()),
            change_log: Mutex::new(HashMap::new()),
        }
    }

    /// Run one full sync across all known projects. A failing project is
    /// recorded and skipped; it never cancels the run.
    pub async fn run_sync(&self, cancel: &CancellationToken) -> Result<RunReport, SyncError> {
        let cfg = self.config.current();
        self.flap.lock().await.begin_run();

        // Discover: every tracker project gets (or refreshes) its row.
        let tracker_projects = self.tracker.list_projects().await?;
        for tp in &tracker_projects {
            let mut project = self
                .store
                .get_project(&tp.identifier)
                .await?
                .unwrap_or_else(|| Project::new(&tp.identifier, &tp.name));
            project.name = tp.name.clone();
            project.tracker_id = Some(tp.id.clone());
            if let Some(desc) = &tp.description {
                project.description_hash = Some(content_hash(desc));
            }
            self.store.upsert_project(&project).await?;
        }

        let mut projects = self.store.list_projects().await?;
        if cfg.skip_empty_projects {
            let now = Utc::now();
            projects.retain(|p| {
                !(p.state == ProjectState::Empty
                    && p.last_sync_at
                        .map(|t| now - t < empty_project_ttl())
                        .unwrap_or(false))
            });
        }

        let mut report = RunReport::default();
        let results: Vec<(String, Result<u32, SyncError>)> = if cfg.sync_parallel
            && cfg.max_workers > 1
        {
            stream::iter(projects)
                .map(|p| async move { (p.identifier.clone(), self.sync_project(&p, cancel).await) })
                .buffer_unordered(cfg.max_workers)
                .collect()
                .await
        } else {
            let mut out = Vec::new();
            for p in projects {
                out.push((p.identifier.clone(), self.sync_project(&p, cancel).await));
            }
            out
        };

        for (ident, result) in results {
            report.projects_processed += 1;
            match result {
                Ok(synced) => report.issues_synced += synced,
                Err(SyncError::Cancelled) => {
                    report.projects_failed += 1;
                    report.errors.insert(ident, "cancelled".to_string());
                }
                Err(e) => {
                    warn!(project = %ident, error = %e, "project sync failed");
                    report.projects_failed += 1;
                    report.errors.insert(ident, e.to_string());
                }
            }
        }

        // End of run: the platform hash cache is agent-scoped and must not
        // outlive the run.
        if let Some(agents) = &self.agents {
            agents.clear_platform_caches();
        }
        Ok(report)
    }

    /// Reconcile a single project end-to-end. Returns the number of issue
    /// mutations propagated to external sources.
    pub async fn sync_project(
        &self,
        project_row: &Project,
        cancel: &CancellationToken,
    ) -> Result<u32, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let cfg = self.config.current();
        let ident = project_row.identifier.clone();

        let mutex = self.mutexes.get(&ident);
        let _guard = mutex.lock().await;

        let mut project = self
            .store
            .get_project(&ident)
            .await?
            .unwrap_or_else(|| project_row.clone());

        // -- Phase 0: discover ------------------------------------------------
        let board_projects = self.board.list_projects().await?;
        let board_project = match project
            .board_id
            .as_ref()
            .and_then(|id| board_projects.iter().find(|bp| &bp.id == id))
        {
            Some(bp) => bp.clone(),
            None => {
                let by_name = board_projects
                    .iter()
                    .find(|bp| bp.name == project.name || bp.name == ident);
                match by_name {
                    Some(bp) => bp.clone(),
                    None if cfg.dry_run => {
                        info!(project = %ident, "dry run: would create board project");
                        return Ok(0);
                    }
                    None => {
                        let created = self
                            .board
                            .create_project(&project.name, project.filesystem_path.as_deref())
                            .await?;
                        info!(project = %ident, board_id = %created.id, "created board project");
                        created
                    }
                }
            }
        };
        project.board_id = Some(board_project.id.clone());

        if project.filesystem_path.is_none() {
            let candidate = cfg.stacks_dir.join(ident.to_lowercase());
            if candidate.is_dir() {
                project.filesystem_path = Some(candidate.to_string_lossy().into_owned());
            }
        }

        // The row must exist before any issue or agent binding references it.
        self.store.upsert_project(&project).await?;

        // -- Fetch both sides -------------------------------------------------
        let since = if cfg.incremental_sync {
            project.last_sync_at
        } else {
            None
        };
        let tracker_issues = self.tracker.list_issues(&ident, since).await?;
        let board_tasks = self.board.list_tasks(&board_project.id).await?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Working set: canonical issues for this project, updated in memory
        // and committed in one batch per phase group.
        let mut issues: BTreeMap<String, Issue> = self
            .store
            .issues_for_project(&ident)
            .await?
            .into_iter()
            .map(|i| (i.identifier.clone(), i))
            .collect();

        // Fold tracker observations into the working set.
        for ti in &tracker_issues {
            let entry = issues.entry(ti.identifier.clone()).or_insert_with(|| {
                Issue::new(&ti.identifier, &ident, &ti.title, canonical_tracker(&ti.status))
            });
            let canonical = canonical_tracker(&ti.status).to_string();
            if entry.status != canonical {
                self.record_transition(&ident, &ti.identifier, &entry.status, &canonical)
                    .await;
            }
            entry.title = ti.title.clone();
            entry.status = canonical;
            entry.tracker_status = Some(ti.status.clone());
            entry.tracker_id = Some(ti.id.clone());
            if ti.modified_at.is_some() {
                entry.tracker_modified_at = ti.modified_at;
            }
            if ti.priority.is_some() {
                entry.priority = ti.priority.clone();
            }
            if let Some(desc) = &ti.description {
                entry.description = Some(desc.clone());
                entry.description_hash = Some(content_hash(desc));
            }
            entry.updated_at = Utc::now();
        }

        let mut synced: u32 = 0;

        // Tracker-side deletion is authoritative; only detectable on a full
        // listing.
        if since.is_none() {
            let deleted: Vec<String> = issues
                .values()
                .filter(|i| {
                    i.tracker_id.is_some()
                        && !tracker_issues.iter().any(|ti| ti.identifier == i.identifier)
                })
                .map(|i| i.identifier.clone())
                .collect();
            for gone in deleted {
                let issue = issues.remove(&gone).unwrap_or_else(|| {
                    Issue::new(&gone, &ident, "", "Cancelled")
                });
                info!(project = %ident, issue = %gone, "issue deleted in tracker, cascading");
                if !cfg.dry_run {
                    if let Some(task_id) = &issue.board_task_id {
                        if let Err(e) = self.board.archive_task(task_id).await {
                            warn!(issue = %gone, error = %e, "board archive failed");
                        }
                    }
                    if let (Some(local_id), Some(path)) =
                        (&issue.local_store_id, &project.filesystem_path)
                    {
                        let path = Path::new(path);
                        if LocalStoreAdapter::store_exists(path) {
                            if let Err(e) = self.local.close_issue(&ident, path, local_id).await
                            {
                                warn!(issue = %gone, error = %e, "local close failed");
                            }
                        }
                    }
                }
                self.store.delete_issue(&gone).await?;
                synced += 1;
            }
        }

        // -- Phase 1: Tracker -> Board ---------------------------------------
        let task_by_id: HashMap<String, BoardTask> = board_tasks
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();

        for issue in issues.values_mut() {
            match issue.board_task_id.clone() {
                None => {
                    // Bind by footer first, then by normalized title.
                    let matched = board_tasks.iter().find(|t| {
                        t.description
                            .as_deref()
                            .and_then(extract_footer_identifier)
                            .as_deref()
                            == Some(issue.identifier.as_str())
                            || normalize_title(&t.title) == normalize_title(&issue.title)
                    });
                    match matched {
                        Some(task) => {
                            issue.board_task_id = Some(task.id.clone());
                            issue.board_status = Some(task.status.clone());
                            issue.board_modified_at = task.modified_at;
                        }
                        None if cfg.dry_run => {
                            info!(issue = %issue.identifier, "dry run: would create board task");
                        }
                        None => {
                            let description = match &issue.description {
                                Some(desc) => {
                                    format!("{desc}\n\n{}", footer_line(&issue.identifier))
                                }
                                None => footer_line(&issue.identifier),
                            };
                            let created = self
                                .board
                                .create_task(&CreateTask {
                                    project_id: board_project.id.clone(),
                                    title: issue.title.clone(),
                                    description: Some(description),
                                    status: tracker_to_board(&issue.status).as_str().to_string(),
                                })
                                .await?;
                            debug!(issue = %issue.identifier, task = %created.id, "board task created");
                            issue.board_task_id = Some(created.id.clone());
                            issue.board_status = Some(created.status.clone());
                            issue.board_modified_at = created.modified_at;
                            synced += 1;
                        }
                    }
                }
                Some(task_id) => match task_by_id.get(&task_id) {
                    Some(task) => {
                        let winner = resolve_status(
                            &self.policy,
                            Utc::now(),
                            &issue.status,
                            issue.tracker_modified_at,
                            &task.status,
                            task.modified_at,
                        );
                        match winner {
                            Winner::InSync => {
                                issue.board_status = Some(task.status.clone());
                                issue.board_modified_at = task.modified_at;
                            }
                            Winner::Tracker => {
                                let target = tracker_to_board(&issue.status);
                                let allowed = self
                                    .flap
                                    .lock()
                                    .await
                                    .allow(&issue.identifier, &task.status, target.as_str());
                                if !allowed {
                                    continue;
                                }
                                if cfg.dry_run {
                                    info!(issue = %issue.identifier, to = %target,
                                          "dry run: would update board task status");
                                    continue;
                                }
                                let updated = self
                                    .board
                                    .update_task(
                                        &task_id,
                                        &TaskPatch {
                                            status: Some(target.as_str().to_string()),
                                            ..Default::default()
                                        },
                                    )
                                    .await?;
                                // Observed values, not intended ones.
                                issue.board_status = Some(updated.status.clone());
                                issue.board_modified_at = updated.modified_at;
                                self.record_transition(
                                    &ident,
                                    &issue.identifier,
                                    &task.status,
                                    target.as_str(),
                                )
                                .await;
                                synced += 1;
                            }
                            // Board wins are applied in phase 2.
                            Winner::Board => {}
                        }
                    }
                    None => {
                        // Task vanished board-side: divergence, re-create on
                        // the next pass.
                        warn!(issue = %issue.identifier, task = %task_id,
                              "bound board task missing, unbinding");
                        self.store.clear_board_binding(&issue.identifier).await?;
                        issue.board_task_id = None;
                        issue.board_status = None;
                        issue.board_modified_at = None;
                    }
                },
            }
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // -- Phase 2: Board -> Tracker ---------------------------------------
        for task in &board_tasks {
            let target_ident = task
                .description
                .as_deref()
                .and_then(extract_footer_identifier)
                .or_else(|| {
                    issues
                        .values()
                        .find(|i| normalize_title(&i.title) == normalize_title(&task.title))
                        .map(|i| i.identifier.clone())
                });
            let Some(target_ident) = target_ident else {
                debug!(task = %task.id, title = %task.title,
                       "board task has no tracker counterpart, marking divergence");
                continue;
            };
            let Some(issue) = issues.get_mut(&target_ident) else {
                continue;
            };

            let mapped_tracker = board_to_tracker(BoardStatus::parse(&task.status));
            if mapped_tracker == issue.status {
                continue;
            }
            let winner = resolve_status(
                &self.policy,
                Utc::now(),
                &issue.status,
                issue.tracker_modified_at,
                &task.status,
                task.modified_at,
            );
            if winner != Winner::Board {
                // When uncertain, leave the tracker unchanged and mark the
                // divergence.
                debug!(issue = %issue.identifier, board = %task.status,
                       tracker = %issue.status, "board change not applied");
                continue;
            }
            let Some(tracker_id) = issue.tracker_id.clone() else {
                continue;
            };
            let allowed = self
                .flap
                .lock()
                .await
                .allow(&issue.identifier, &issue.status, mapped_tracker);
            if !allowed {
                continue;
            }
            if cfg.dry_run {
                info!(issue = %issue.identifier, to = %mapped_tracker,
                      "dry run: would update tracker status");
                continue;
            }
            let from = issue.status.clone();
            let updated = self
                .tracker
                .update_issue_status(&tracker_id, mapped_tracker)
                .await?;
            issue.status = canonical_tracker(&updated.status).to_string();
            issue.tracker_status = Some(updated.status.clone());
            if updated.modified_at.is_some() {
                issue.tracker_modified_at = updated.modified_at;
            }
            issue.board_status = Some(task.status.clone());
            issue.board_modified_at = task.modified_at;
            issue.updated_at = Utc::now();
            self.record_transition(&ident, &issue.identifier, &from, &issue.status)
                .await;
            synced += 1;
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // -- Phase 3: Tracker <-> Local ---------------------------------------
        if let Some(path_str) = project.filesystem_path.clone() {
            let path = Path::new(&path_str);
            if LocalStoreAdapter::store_exists(path) {
                synced += self
                    .sync_local(&ident, path, &mut issues, cfg.dry_run)
                    .await?;
            }
        }

        // Commit the working set in one batch.
        let batch: Vec<Issue> = issues.values().cloned().collect();
        self.store.upsert_issues(&batch).await?;

        // Settle the project row before the agent phase so the memory blocks
        // are built from final values; a lagging issue_count would dirty the
        // project block on the following run.
        let final_count = issues.len() as u32;
        project.issue_count = final_count;
        project.state = if final_count == 0 {
            ProjectState::Empty
        } else {
            ProjectState::Active
        };

        // -- Phase 4: Agent ----------------------------------------------------
        if let Some(agents) = &self.agents {
            let fresh = self.store.issues_for_project(&ident).await?;
            let entries = self
                .change_log
                .lock()
                .await
                .get(&ident)
                .cloned()
                .unwrap_or_default();
            let block_values = build_block_values(&project, &fresh, &entries);
            let outcome = agents.sync_project_agent(&project, &block_values).await?;
            if !outcome.block_errors.is_empty() {
                warn!(project = %ident, failed = outcome.block_errors.len(),
                      "agent block upsert partially failed");
            }
        }

        // Finalize the project row.
        project.last_sync_at = Some(Utc::now());
        self.store.upsert_project(&project).await?;

        Ok(synced)
    }

    async fn sync_local(
        &self,
        ident: &str,
        path: &Path,
        issues: &mut BTreeMap<String, Issue>,
        dry_run: bool,
    ) -> Result<u32, SyncError> {
        let local_issues = self.local.list_issues(path).await?;
        let mut synced = 0;

        for issue in issues.values_mut() {
            match issue.local_store_id.clone() {
                None => {
                    let matched = local_issues
                        .iter()
                        .find(|li| normalize_title(&li.title) == normalize_title(&issue.title));
                    match matched {
                        Some(li) => {
                            issue.local_store_id = Some(li.id.clone());
                            issue.local_status = Some(li.status.clone());
                        }
                        None if dry_run => {
                            info!(issue = %issue.identifier, "dry run: would create local issue");
                        }
                        None => {
                            let id = self
                                .local
                                .create_issue(
                                    ident,
                                    path,
                                    &issue.title,
                                    issue.description.as_deref(),
                                    &issue.status,
                                )
                                .await?;
                            issue.local_store_id = Some(id);
                            issue.local_status = Some(issue.status.clone());
                            issue.local_modified_at = Some(Utc::now());
                            synced += 1;
                        }
                    }
                }
                Some(local_id) => {
                    let Some(li) = local_issues.iter().find(|li| li.id == local_id) else {
                        warn!(issue = %issue.identifier, local_id = %local_id,
                              "bound local issue missing, unbinding");
                        self.store.clear_local_binding(&issue.identifier).await?;
                        issue.local_store_id = None;
                        issue.local_status = None;
                        issue.local_modified_at = None;
                        continue;
                    };

                    if li.closed && !is_terminal(&issue.status) {
                        // Closure propagates local -> tracker.
                        let allowed = self
                            .flap
                            .lock()
                            .await
                            .allow(&issue.identifier, &issue.status, "Done");
                        if allowed && !dry_run {
                            if let Some(tracker_id) = issue.tracker_id.clone() {
                                let from = issue.status.clone();
                                let updated = self
                                    .tracker
                                    .update_issue_status(&tracker_id, "Done")
                                    .await?;
                                issue.status = canonical_tracker(&updated.status).to_string();
                                issue.tracker_status = Some(updated.status.clone());
                                if updated.modified_at.is_some() {
                                    issue.tracker_modified_at = updated.modified_at;
                                }
                                issue.local_status = Some(li.status.clone());
                                self.record_transition(
                                    ident,
                                    &issue.identifier,
                                    &from,
                                    &issue.status,
                                )
                                .await;
                                synced += 1;
                            }
                        }
                    } else if is_terminal(&issue.status) && !li.closed {
                        if !dry_run {
                            self.local.close_issue(ident, path, &local_id).await?;
                            issue.local_status = Some(issue.status.clone());
                            issue.local_modified_at = Some(Utc::now());
                            synced += 1;
                        }
                    } else if li.status != issue.status {
                        if !dry_run {
                            self.local
                                .update_status(ident, path, &local_id, &issue.status)
                                .await?;
                            issue.local_status = Some(issue.status.clone());
                            issue.local_modified_at = Some(Utc::now());
                            synced += 1;
                        }
                    } else {
                        issue.local_status = Some(li.status.clone());
                    }
                }
            }
        }
        Ok(synced)
    }

    /// Periodic exhaustive pass: compare all three sources project by
    /// project and report every three-way status disagreement. Read-only.
    pub async fn reconcile(&self) -> Result<DivergenceReport, SyncError> {
        let mut report = DivergenceReport::default();
        let projects = self.store.list_projects().await?;

        for project in projects {
            report.projects_checked += 1;
            let issues = self.store.issues_for_project(&project.identifier).await?;

            let tracker_issues = self.tracker.list_issues(&project.identifier, None).await?;
            let board_tasks = match &project.board_id {
                Some(id) => self.board.list_tasks(id).await?,
                None => Vec::new(),
            };
            let local_issues = match &project.filesystem_path {
                Some(p) if LocalStoreAdapter::store_exists(Path::new(p)) => {
                    self.local.list_issues(Path::new(p)).await?
                }
                _ => Vec::new(),
            };

            for issue in issues {
                let tracker_status = tracker_issues
                    .iter()
                    .find(|ti| ti.identifier == issue.identifier)
                    .map(|ti| canonical_tracker(&ti.status).to_string());
                let board_status = issue.board_task_id.as_ref().and_then(|tid| {
                    board_tasks
                        .iter()
                        .find(|t| &t.id == tid)
                        .map(|t| board_to_tracker(BoardStatus::parse(&t.status)).to_string())
                });
                let local_status = issue.local_store_id.as_ref().and_then(|lid| {
                    local_issues
                        .iter()
                        .find(|li| &li.id == lid)
                        .map(|li| canonical_tracker(&li.status).to_string())
                });

                let mut observed: Vec<&String> = Vec::new();
                for s in [&tracker_status, &board_status, &local_status] {
                    if let Some(s) = s {
                        observed.push(s);
                    }
                }
                let diverged = observed
                    .windows(2)
                    .any(|pair| pair[0] != pair[1]);
                if diverged {
                    report.divergences.push(Divergence {
                        issue_identifier: issue.identifier.clone(),
                        project_identifier: project.identifier.clone(),
                        tracker_status,
                        board_status,
                        local_status,
                    });
                }
            }
        }

        if !report.divergences.is_empty() {
            warn!(count = report.divergences.len(), "reconciliation found divergences");
        }
        Ok(report)
    }

    async fn record_transition(&self, project: &str, issue: &str, from: &str, to: &str) {
        if from == to {
            return;
        }
        let mut log = self.change_log.lock().await;
        let entries = log.entry(project.to_string()).or_default();
        entries.push(ChangeLogEntry {
            issue_identifier: issue.to_string(),
            from_status: from.to_string(),
            to_status: to.to_string(),
        });
        if entries.len() > CHANGE_LOG_CAP {
            let excess = entries.len() - CHANGE_LOG_CAP;
            entries.drain(..excess);
        }
    }
}

/// Assemble the computed block values for the agent phase. Persona, human,
/// and scratchpad are seeded at agent creation and not recomputed here.
fn build_block_values(
    project: &Project,
    issues: &[Issue],
    change_entries: &[ChangeLogEntry],
) -> Vec<(String, String)> {
    vec![
        ("project".to_string(), blocks::project_block(project)),
        ("board_config".to_string(), blocks::board_config_block(project)),
        ("board_metrics".to_string(), blocks::board_metrics_block(issues)),
        ("hotspots".to_string(), blocks::hotspots_block(issues)),
        (
            "backlog_summary".to_string(),
            blocks::backlog_summary_block(issues),
        ),
        (
            "change_log".to_string(),
            blocks::change_log_block(change_entries),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    use axum::extract::{Path as AxPath, State};
    use axum::response::IntoResponse;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};

    use vs_clients::http::HttpPool;
    use vs_core::config::Config;

    // -- Stub tracker + board -----------------------------------------------

    #[derive(Debug, Clone, serde::Serialize)]
    struct StubTrackerIssue {
        id: String,
        identifier: String,
        title: String,
        status: String,
        modified_at: Option<String>,
        description: Option<String>,
    }

    #[derive(Debug, Clone, serde::Serialize)]
    struct StubTask {
        id: String,
        project_id: String,
        title: String,
        description: Option<String>,
        status: String,
        modified_at: Option<String>,
    }

    #[derive(Default)]
    struct Stub {
        tracker_issues: StdMutex<Vec<StubTrackerIssue>>,
        board_projects: StdMutex<Vec<(String, String)>>, // (id, name)
        tasks: StdMutex<Vec<StubTask>>,
        tracker_updates: AtomicU32,
        board_creates: AtomicU32,
        board_updates: AtomicU32,
        next_task: AtomicU32,
    }

    impl Stub {
        fn add_tracker_issue(&self, identifier: &str, title: &str, status: &str, modified_mins_ago: i64) {
            let ts = (Utc::now() - Duration::minutes(modified_mins_ago)).to_rfc3339();
            self.tracker_issues.lock().unwrap().push(StubTrackerIssue {
                id: format!("trk-{identifier}"),
                identifier: identifier.to_string(),
                title: title.to_string(),
                status: status.to_string(),
                modified_at: Some(ts),
                description: None,
            });
        }
    }

    fn tracker_router(stub: Arc<Stub>) -> Router {
        Router::new()
            .route(
                "/api/projects",
                get(|| async {
                    Json(serde_json::json!([
                        {"id": "trk-proj-1", "identifier": "ACME", "name": "Acme Corp"}
                    ]))
                }),
            )
            .route(
                "/api/projects/{ident}/issues",
                get(|State(s): State<Arc<Stub>>| async move {
                    let issues = s.tracker_issues.lock().unwrap().clone();
                    Json(serde_json::json!(issues))
                }),
            )
            .route(
                "/api/issues/{id}",
                put(
                    |State(s): State<Arc<Stub>>,
                     AxPath(id): AxPath<String>,
                     Json(body): Json<serde_json::Value>| async move {
                        s.tracker_updates.fetch_add(1, Ordering::SeqCst);
                        let mut issues = s.tracker_issues.lock().unwrap();
                        let issue = issues.iter_mut().find(|i| i.id == id).unwrap();
                        if let Some(status) = body["status"].as_str() {
                            issue.status = status.to_string();
                        }
                        if let Some(desc) = body["description"].as_str() {
                            issue.description = Some(desc.to_string());
                        }
                        issue.modified_at = Some(Utc::now().to_rfc3339());
                        Json(serde_json::json!(issue.clone()))
                    },
                ),
            )
            .with_state(stub)
    }

    fn board_router(stub: Arc<Stub>) -> Router {
        Router::new()
            .route(
                "/api/projects",
                get(|State(s): State<Arc<Stub>>| async move {
                    let projects = s.board_projects.lock().unwrap();
                    Json(serde_json::json!(projects
                        .iter()
                        .map(|(id, name)| serde_json::json!({"id": id, "name": name}))
                        .collect::<Vec<_>>()))
                })
                .post(
                    |State(s): State<Arc<Stub>>, Json(body): Json<serde_json::Value>| async move {
                        let name = body["name"].as_str().unwrap_or_default().to_string();
                        let id = format!("brd-{}", name.to_lowercase().replace(' ', "-"));
                        s.board_projects.lock().unwrap().push((id.clone(), name.clone()));
                        Json(serde_json::json!({"id": id, "name": name}))
                    },
                ),
            )
            .route(
                "/api/projects/{id}/tasks",
                get(|State(s): State<Arc<Stub>>, AxPath(id): AxPath<String>| async move {
                    let tasks = s.tasks.lock().unwrap();
                    let out: Vec<StubTask> = tasks
                        .iter()
                        .filter(|t| t.project_id == id)
                        .cloned()
                        .collect();
                    Json(serde_json::json!(out))
                }),
            )
            .route(
                "/api/tasks",
                post(
                    |State(s): State<Arc<Stub>>, Json(body): Json<serde_json::Value>| async move {
                        s.board_creates.fetch_add(1, Ordering::SeqCst);
                        let n = s.next_task.fetch_add(1, Ordering::SeqCst);
                        let task = StubTask {
                            id: format!("task-{n}"),
                            project_id: body["project_id"].as_str().unwrap_or_default().into(),
                            title: body["title"].as_str().unwrap_or_default().into(),
                            description: body["description"].as_str().map(String::from),
                            status: body["status"].as_str().unwrap_or("todo").into(),
                            modified_at: Some(Utc::now().to_rfc3339()),
                        };
                        s.tasks.lock().unwrap().push(task.clone());
                        Json(serde_json::json!(task))
                    },
                ),
            )
            .route(
                "/api/tasks/{id}",
                put(
                    |State(s): State<Arc<Stub>>,
                     AxPath(id): AxPath<String>,
                     Json(body): Json<serde_json::Value>| async move {
                        s.board_updates.fetch_add(1, Ordering::SeqCst);
                        let mut tasks = s.tasks.lock().unwrap();
                        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
                            return axum::http::StatusCode::NOT_FOUND.into_response();
                        };
                        if let Some(status) = body["status"].as_str() {
                            task.status = status.to_string();
                        }
                        task.modified_at = Some(Utc::now().to_rfc3339());
                        Json(serde_json::json!(task.clone())).into_response()
                    },
                ),
            )
            .with_state(stub)
    }

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn orchestrator(stub: Arc<Stub>) -> (SyncOrchestrator, Arc<StateStore>) {
        let tracker_base = spawn_server(tracker_router(Arc::clone(&stub))).await;
        let board_base = spawn_server(board_router(Arc::clone(&stub))).await;

        let pool = Arc::new(HttpPool::new(CancellationToken::new(), 0));
        let store = Arc::new(StateStore::open_in_memory().await.unwrap());
        let mutexes = ProjectMutexes::new();
        let orch = SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::new(TrackerClient::new(Arc::clone(&pool), tracker_base)),
            Arc::new(BoardClient::new(Arc::clone(&pool), board_base)),
            Arc::new(LocalStoreAdapter::new()),
            None,
            ConfigHandle::new(Config {
                incremental_sync: false,
                ..Config::default()
            }),
            mutexes,
        );
        (orch, store)
    }

    #[tokio::test]
    async fn initial_bind_creates_board_task_with_footer() {
        // Scenario 1: tracker has ACME-1 "Bootstrap" in Backlog, board empty.
        let stub = Arc::new(Stub::default());
        stub.add_tracker_issue("ACME-1", "Bootstrap", "Backlog", 10);

        let (orch, store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        let report = orch.run_sync(&cancel).await.unwrap();

        assert_eq!(report.projects_processed, 1);
        assert_eq!(report.projects_failed, 0);

        // Board now has project ACME with one task, status todo, footer set.
        let tasks = stub.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Bootstrap");
        assert_eq!(tasks[0].status, "todo");
        let desc = tasks[0].description.clone().unwrap();
        assert!(desc.trim_end().ends_with("Huly Issue: ACME-1"), "desc: {desc}");

        // Store has the bound issue row.
        let issue = store.get_issue("ACME-1").await.unwrap().unwrap();
        assert_eq!(issue.status, "Backlog");
        assert_eq!(issue.board_status.as_deref(), Some("todo"));
        assert!(issue.board_task_id.is_some());
        let project = store.get_project("ACME").await.unwrap().unwrap();
        assert_eq!(project.issue_count, 1);
        assert!(project.board_id.is_some());
    }

    #[tokio::test]
    async fn second_run_with_no_changes_writes_nothing() {
        // Idempotence law: run twice, second run performs zero external
        // writes.
        let stub = Arc::new(Stub::default());
        stub.add_tracker_issue("ACME-1", "Bootstrap", "Backlog", 10);

        let (orch, _store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        orch.run_sync(&cancel).await.unwrap();

        let creates = stub.board_creates.load(Ordering::SeqCst);
        let board_updates = stub.board_updates.load(Ordering::SeqCst);
        let tracker_updates = stub.tracker_updates.load(Ordering::SeqCst);

        let report = orch.run_sync(&cancel).await.unwrap();
        assert_eq!(report.issues_synced, 0);
        assert_eq!(stub.board_creates.load(Ordering::SeqCst), creates);
        assert_eq!(stub.board_updates.load(Ordering::SeqCst), board_updates);
        assert_eq!(stub.tracker_updates.load(Ordering::SeqCst), tracker_updates);
    }

    #[tokio::test]
    async fn fresh_board_move_propagates_to_tracker() {
        // Scenario 2: the user drags the task to inprogress; board timestamp
        // is fresh, tracker's is old.
        let stub = Arc::new(Stub::default());
        stub.add_tracker_issue("ACME-1", "Bootstrap", "Backlog", 120);

        let (orch, store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        orch.run_sync(&cancel).await.unwrap();

        // User moves the task on the board.
        {
            let mut tasks = stub.tasks.lock().unwrap();
            tasks[0].status = "inprogress".to_string();
            tasks[0].modified_at = Some(Utc::now().to_rfc3339());
        }

        orch.run_sync(&cancel).await.unwrap();

        let issue = store.get_issue("ACME-1").await.unwrap().unwrap();
        assert_eq!(issue.status, "In Progress");
        assert_eq!(issue.board_status.as_deref(), Some("inprogress"));
        let tracker = stub.tracker_issues.lock().unwrap();
        assert_eq!(tracker[0].status, "In Progress");
    }

    #[tokio::test]
    async fn stale_board_timestamp_yields_to_tracker() {
        // Scenario 3: board still says todo with a 10-day-old timestamp;
        // tracker moved to Done minutes ago. Board gets updated; no flap.
        let stub = Arc::new(Stub::default());
        stub.add_tracker_issue("ACME-1", "Bootstrap", "Backlog", 60);

        let (orch, store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        orch.run_sync(&cancel).await.unwrap();

        // Tracker moves to Done; board task keeps an ancient timestamp.
        {
            let mut tracker = stub.tracker_issues.lock().unwrap();
            tracker[0].status = "Done".to_string();
            tracker[0].modified_at = Some((Utc::now() - Duration::minutes(5)).to_rfc3339());
            let mut tasks = stub.tasks.lock().unwrap();
            tasks[0].modified_at =
                Some((Utc::now() - Duration::days(10)).to_rfc3339());
        }

        orch.run_sync(&cancel).await.unwrap();

        let tasks = stub.tasks.lock().unwrap().clone();
        assert_eq!(tasks[0].status, "done");
        let tracker = stub.tracker_issues.lock().unwrap();
        assert_eq!(tracker[0].status, "Done");
        let issue = store.get_issue("ACME-1").await.unwrap().unwrap();
        assert_eq!(issue.status, "Done");
        assert_eq!(issue.board_status.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn tracker_deletion_cascades_to_board_archive() {
        let stub = Arc::new(Stub::default());
        stub.add_tracker_issue("ACME-1", "Bootstrap", "Backlog", 10);
        stub.add_tracker_issue("ACME-2", "Second", "Backlog", 10);

        let (orch, store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        orch.run_sync(&cancel).await.unwrap();
        assert_eq!(stub.tasks.lock().unwrap().len(), 2);

        // ACME-2 is deleted in the tracker.
        stub.tracker_issues.lock().unwrap().retain(|i| i.identifier != "ACME-2");
        orch.run_sync(&cancel).await.unwrap();

        assert!(store.get_issue("ACME-2").await.unwrap().is_none());
        // The board task was archived through a PUT update.
        assert!(stub.board_updates.load(Ordering::SeqCst) >= 1);
        let project = store.get_project("ACME").await.unwrap().unwrap();
        assert_eq!(project.issue_count, 1);
    }

    #[tokio::test]
    async fn existing_task_is_bound_by_footer_not_duplicated() {
        let stub = Arc::new(Stub::default());
        stub.add_tracker_issue("ACME-1", "Bootstrap", "Backlog", 10);
        stub.board_projects
            .lock()
            .unwrap()
            .push(("brd-acme".to_string(), "Acme Corp".to_string()));
        stub.tasks.lock().unwrap().push(StubTask {
            id: "task-existing".to_string(),
            project_id: "brd-acme".to_string(),
            title: "Renamed board title".to_string(),
            description: Some("body\n\nHuly Issue: ACME-1".to_string()),
            status: "todo".to_string(),
            modified_at: Some(Utc::now().to_rfc3339()),
        });

        let (orch, store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        orch.run_sync(&cancel).await.unwrap();

        // Bound by footer; no new task was created.
        assert_eq!(stub.board_creates.load(Ordering::SeqCst), 0);
        let issue = store.get_issue("ACME-1").await.unwrap().unwrap();
        assert_eq!(issue.board_task_id.as_deref(), Some("task-existing"));
    }

    #[tokio::test]
    async fn empty_project_is_marked_and_skipped_within_ttl() {
        let stub = Arc::new(Stub::default());
        // Tracker knows the project but it has no issues.

        let (orch, store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        orch.run_sync(&cancel).await.unwrap();

        let project = store.get_project("ACME").await.unwrap().unwrap();
        assert_eq!(project.state, ProjectState::Empty);

        // Within the TTL the project is skipped entirely.
        let report = orch.run_sync(&cancel).await.unwrap();
        assert_eq!(report.projects_processed, 0);
    }

    #[tokio::test]
    async fn reconcile_reports_three_way_divergence() {
        let stub = Arc::new(Stub::default());
        stub.add_tracker_issue("ACME-1", "Bootstrap", "Backlog", 10);

        let (orch, _store) = orchestrator(Arc::clone(&stub)).await;
        let cancel = CancellationToken::new();
        orch.run_sync(&cancel).await.unwrap();

        // Mutate the board behind the engine's back with a stale timestamp so
        // sync would not repair it immediately.
        {
            let mut tasks = stub.tasks.lock().unwrap();
            tasks[0].status = "done".to_string();
            tasks[0].modified_at = Some((Utc::now() - Duration::days(10)).to_rfc3339());
        }

        let report = orch.reconcile().await.unwrap();
        assert_eq!(report.projects_checked, 1);
        assert_eq!(report.divergences.len(), 1);
        let d = &report.divergences[0];
        assert_eq!(d.issue_identifier, "ACME-1");
        assert_eq!(d.tracker_status.as_deref(), Some("Backlog"));
        assert_eq!(d.board_status.as_deref(), Some("Done"));
    }

    // -- Pure helpers --------------------------------------------------------

    #[test]
    fn footer_roundtrip() {
        let line = footer_line("ACME-42");
        assert_eq!(line, "Huly Issue: ACME-42");
        assert_eq!(
            extract_footer_identifier(&format!("body text\n\n{line}")),
            Some("ACME-42".to_string())
        );
    }

    #[test]
    fn footer_accepts_alternate_spelling() {
        assert_eq!(
            extract_footer_identifier("desc\nSynced from Huly: ACME-7"),
            Some("ACME-7".to_string())
        );
        assert_eq!(extract_footer_identifier("no footer here"), None);
        assert_eq!(extract_footer_identifier("Huly Issue:"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(is_terminal("Done"));
        assert!(is_terminal("cancelled"));
        assert!(!is_terminal("In Progress"));
        assert!(!is_terminal("Backlog"));
    }
}
