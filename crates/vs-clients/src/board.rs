//! Typed client for the kanban board's REST surface and its SSE task-event
//! stream. One wire-level contract is enforced here: every task/project
//! update goes out as `PUT` -- the board platform silently ignores `PATCH`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{HttpError, HttpPool};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("network error: {0}")]
    Network(String),
    #[error("board returned HTTP {0}")]
    Http(u16),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("request timed out")]
    Timeout,
    /// A request violated the board's wire contract before it was sent.
    #[error("contract violation: {0}")]
    Contract(String),
}

impl From<HttpError> for BoardError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Network(msg) => BoardError::Network(msg),
            HttpError::Status(code) => BoardError::Http(code),
            HttpError::Timeout => BoardError::Timeout,
            HttpError::Cancelled => BoardError::Network("cancelled".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BoardError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub git_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardTask {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Raw board lattice label (`todo`, `inprogress`, ...).
    pub status: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTask {
    pub project_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: String,
}

/// Partial update; absent fields are left untouched by the board.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkTaskUpdate {
    pub id: String,
    #[serde(flatten)]
    pub patch: TaskPatch,
}

/// One classified event from the SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardTaskEvent {
    pub task_id: String,
    pub project_id: String,
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BoardClient {
    pool: Arc<HttpPool>,
    base_url: String,
}

impl BoardClient {
    pub fn new(pool: Arc<HttpPool>, base_url: impl Into<String>) -> Self {
        Self {
            pool,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Guard for mutating requests: the board accepts `PUT` only. Building
    /// an update through any other method is a contract violation caught
    /// before a byte leaves the process.
    fn update_request(&self, method: Method, url: String) -> Result<reqwest::RequestBuilder> {
        if method != Method::PUT {
            return Err(BoardError::Contract(format!(
                "board updates must use PUT, got {method}"
            )));
        }
        Ok(self.pool.client().request(method, url))
    }

    /// Startup health check. The board's `/health` endpoint historically
    /// returns a non-JSON body on some deployments; reachability is defined
    /// as "a projects list can be retrieved".
    pub async fn ensure_reachable(&self) -> Result<()> {
        let health = self.pool.client().get(self.url("/health"));
        if let Ok(resp) = self.pool.send("board", health).await {
            if resp.json::<serde_json::Value>().await.is_ok() {
                return Ok(());
            }
            debug!("board /health returned non-JSON body, falling back to project listing");
        }
        self.list_projects().await.map(|_| ())
    }

    // -- Projects -----------------------------------------------------------

    pub async fn list_projects(&self) -> Result<Vec<BoardProject>> {
        let req = self.pool.client().get(self.url("/api/projects"));
        let resp = self.pool.send("board", req).await?;
        resp.json().await.map_err(|e| BoardError::Parse(e.to_string()))
    }

    pub async fn create_project(&self, name: &str, git_path: Option<&str>) -> Result<BoardProject> {
        self.pool.pace().await;
        let req = self
            .pool
            .client()
            .post(self.url("/api/projects"))
            .json(&serde_json::json!({ "name": name, "git_path": git_path }));
        let resp = self.pool.send("board", req).await?;
        resp.json().await.map_err(|e| BoardError::Parse(e.to_string()))
    }

    pub async fn update_project(&self, id: &str, name: &str) -> Result<BoardProject> {
        self.pool.pace().await;
        let req = self
            .update_request(Method::PUT, self.url(&format!("/api/projects/{id}")))?
            .json(&serde_json::json!({ "name": name }));
        let resp = self.pool.send("board", req).await?;
        resp.json().await.map_err(|e| BoardError::Parse(e.to_string()))
    }

    // -- Tasks --------------------------------------------------------------

    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<BoardTask>> {
        let req = self
            .pool
            .client()
            .get(self.url(&format!("/api/projects/{project_id}/tasks")));
        let resp = self.pool.send("board", req).await?;
        resp.json().await.map_err(|e| BoardError::Parse(e.to_string()))
    }

    pub async fn create_task(&self, task: &CreateTask) -> Result<BoardTask> {
        self.pool.pace().await;
        let req = self.pool.client().post(self.url("/api/tasks")).json(task);
        let resp = self.pool.send("board", req).await?;
        resp.json().await.map_err(|e| BoardError::Parse(e.to_string()))
    }

    pub async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<BoardTask> {
        self.pool.pace().await;
        let req = self
            .update_request(Method::PUT, self.url(&format!("/api/tasks/{id}")))?
            .json(patch);
        let resp = self.pool.send("board", req).await?;
        resp.json().await.map_err(|e| BoardError::Parse(e.to_string()))
    }

    /// Archive rather than delete: tracker-side deletion cascades to board
    /// archival, never to destructive removal.
    pub async fn archive_task(&self, id: &str) -> Result<BoardTask> {
        self.update_task(
            id,
            &TaskPatch {
                archived: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Bulk task update in one round trip.
    pub async fn bulk_update_tasks(&self, updates: &[BulkTaskUpdate]) -> Result<Vec<BoardTask>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        self.pool.pace().await;
        let req = self
            .update_request(Method::PUT, self.url("/api/tasks/bulk"))?
            .json(&serde_json::json!({ "updates": updates }));
        let resp = self.pool.send("board", req).await?;
        resp.json().await.map_err(|e| BoardError::Parse(e.to_string()))
    }

    // -- SSE ----------------------------------------------------------------

    /// Subscribe to the board's task event stream. Events are delivered on
    /// the returned channel; the background task reconnects with backoff
    /// until the token is cancelled or the receiver is dropped.
    pub fn subscribe_task_events(&self, cancel: CancellationToken) -> flume::Receiver<BoardTaskEvent> {
        let (tx, rx) = flume::bounded(256);
        let client = self.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match client.run_sse_once(&tx, &cancel).await {
                    Ok(()) => {
                        // Clean EOF: server closed the stream; reconnect soon.
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        warn!(error = %e, "board SSE stream failed, reconnecting");
                        backoff = (backoff * 2).min(Duration::from_secs(60));
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            info!("board SSE subscription stopped");
        });
        rx
    }

    async fn run_sse_once(
        &self,
        tx: &flume::Sender<BoardTaskEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let resp = self
            .pool
            .client()
            .get(self.url("/api/events/tasks"))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| BoardError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BoardError::Http(resp.status().as_u16()));
        }
        info!("board SSE stream connected");

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                c = stream.next() => c,
            };
            let Some(chunk) = chunk else { return Ok(()) };
            let chunk = chunk.map_err(|e| BoardError::Network(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            for payload in drain_sse_events(&mut buffer) {
                match serde_json::from_str::<BoardTaskEvent>(&payload) {
                    Ok(event) => {
                        if tx.send_async(event).await.is_err() {
                            // Receiver gone; stop streaming.
                            return Ok(());
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring unparseable SSE payload"),
                }
            }
        }
    }
}

/// Extract complete `data:` payloads from an SSE buffer, leaving any partial
/// event in place. Events are separated by a blank line; multi-line data
/// fields are joined with newlines per the SSE spec.
fn drain_sse_events(buffer: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let raw: String = buffer.drain(..pos + 2).collect();
        let data: Vec<&str> = raw
            .lines()
            .filter_map(|line| line.strip_prefix("data:").map(str::trim_start))
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    events
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
