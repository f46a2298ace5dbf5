//! Event ingress: webhooks, the board SSE stream, filesystem watchers, and
//! the tracker long-poll feed all normalize into `SyncController` triggers.
//! No shared mutable state crosses a channel boundary; each spawned loop
//! owns its producer side outright.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vs_agents::AgentLifecycleManager;
use vs_clients::board::BoardClient;
use vs_clients::tracker::TrackerClient;
use vs_core::store::StateStore;
use vs_core::watcher::ProjectWatcher;

use crate::controller::SyncController;

/// How often watcher pending-state is polled for settled debounce windows.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backoff ceiling for a failing long-poll subscription.
const LONGPOLL_MAX_BACKOFF: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Webhook normalization
// ---------------------------------------------------------------------------

/// Extract the affected project identifiers from a tracker webhook payload.
/// Accepts both the `changes` array shape and a bare `projects` list;
/// anything unrecognized yields an empty set (the caller falls back to a
/// full sync trigger).
pub fn normalize_tracker_webhook(payload: &serde_json::Value) -> Vec<String> {
    let mut projects = Vec::new();

    if let Some(changes) = payload.get("changes").and_then(|c| c.as_array()) {
        for change in changes {
            if let Some(ident) = change.get("project_identifier").and_then(|p| p.as_str()) {
                if !projects.iter().any(|p: &String| p == ident) {
                    projects.push(ident.to_string());
                }
            }
        }
    }
    if let Some(list) = payload.get("projects").and_then(|p| p.as_array()) {
        for ident in list.iter().filter_map(|v| v.as_str()) {
            if !projects.iter().any(|p: &String| p == ident) {
                projects.push(ident.to_string());
            }
        }
    }
    projects
}

// ---------------------------------------------------------------------------
// Spawned ingress loops
// ---------------------------------------------------------------------------

/// Consume the board's SSE task events and trigger syncs.
pub fn spawn_board_sse(
    board: Arc<BoardClient>,
    controller: Arc<SyncController>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let rx = board.subscribe_task_events(cancel.child_token());
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                e = rx.recv_async() => match e {
                    Ok(e) => e,
                    Err(_) => break,
                },
            };
            debug!(task = %event.task_id, kind = %event.kind, "board SSE event");
            controller.trigger_sync("board-sse");
        }
        info!("board SSE ingress stopped");
    })
}

/// Long-poll the tracker change feed. While the subscription is healthy the
/// `webhook_live` flag stays set and the scheduler pauses its periodic
/// polling; on persistent failure the flag drops and polling resumes.
pub fn spawn_tracker_longpoll(
    tracker: Arc<TrackerClient>,
    controller: Arc<SyncController>,
    webhook_live: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut cursor: Option<String> = None;
        let mut backoff = Duration::from_secs(1);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match tracker.poll_changes(cursor.as_deref()).await {
                Ok((changes, next_cursor)) => {
                    webhook_live.store(true, Ordering::SeqCst);
                    backoff = Duration::from_secs(1);
                    cursor = next_cursor;
                    if !changes.is_empty() {
                        debug!(count = changes.len(), "tracker long-poll delivered changes");
                        controller.trigger_sync("tracker-longpoll");
                    }
                }
                Err(e) => {
                    if webhook_live.swap(false, Ordering::SeqCst) {
                        warn!(error = %e, "tracker subscription lost, periodic polling resumes");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(LONGPOLL_MAX_BACKOFF);
                }
            }
        }
        webhook_live.store(false, Ordering::SeqCst);
        info!("tracker long-poll ingress stopped");
    })
}

/// Poll a local-store watcher and trigger a sync for each project whose
/// debounce window settled.
pub fn spawn_localstore_watcher(
    mut watcher: ProjectWatcher,
    controller: Arc<SyncController>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCH_POLL_INTERVAL) => {}
            }
            for project in watcher.poll_settled() {
                info!(project = %project, "local store changed on disk");
                controller.trigger_sync("file-watch");
            }
        }
        info!("local-store watcher stopped");
    })
}

/// Poll a documentation watcher; a settled change re-runs only the agent
/// doc-upload flow, not a general sync.
pub fn spawn_docs_watcher(
    mut watcher: ProjectWatcher,
    lifecycle: Arc<AgentLifecycleManager>,
    store: Arc<StateStore>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCH_POLL_INTERVAL) => {}
            }
            for project_ident in watcher.poll_settled() {
                let project = match store.get_project(&project_ident).await {
                    Ok(Some(p)) => p,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(project = %project_ident, error = %e, "project lookup failed");
                        continue;
                    }
                };
                match lifecycle.refresh_project_docs(&project).await {
                    Ok(0) => {}
                    Ok(n) => info!(project = %project_ident, files = n, "project docs re-uploaded"),
                    Err(e) => {
                        warn!(project = %project_ident, error = %e, "doc refresh failed")
                    }
                }
            }
        }
        info!("docs watcher stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_changes_shape() {
        let payload = serde_json::json!({
            "changes": [
                {"project_identifier": "ACME", "issue_identifier": "ACME-1", "kind": "status"},
                {"project_identifier": "ACME", "kind": "created"},
                {"project_identifier": "OTHER", "kind": "status"}
            ]
        });
        assert_eq!(normalize_tracker_webhook(&payload), vec!["ACME", "OTHER"]);
    }

    #[test]
    fn webhook_projects_shape() {
        let payload = serde_json::json!({ "projects": ["ACME", "OTHER", "ACME"] });
        assert_eq!(normalize_tracker_webhook(&payload), vec!["ACME", "OTHER"]);
    }

    #[test]
    fn webhook_unrecognized_shape_is_empty() {
        let payload = serde_json::json!({ "something": "else" });
        assert!(normalize_tracker_webhook(&payload).is_empty());
    }

    #[test]
    fn webhook_mixed_shapes_merge() {
        let payload = serde_json::json!({
            "changes": [{"project_identifier": "ACME", "kind": "status"}],
            "projects": ["OTHER"]
        });
        assert_eq!(normalize_tracker_webhook(&payload), vec!["ACME", "OTHER"]);
    }
}
