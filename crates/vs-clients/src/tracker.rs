//! Typed client for the Huly issue tracker's REST surface. The tracker is
//! the authoritative system of record: its `PROJ-NNN` identifiers are the
//! canonical issue identity everywhere else.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{HttpError, HttpPool};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("tracker returned HTTP {0}")]
    Http(u16),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("request timed out")]
    Timeout,
}

impl From<HttpError> for TrackerError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Network(msg) => TrackerError::Network(msg),
            HttpError::Status(code) => TrackerError::Http(code),
            HttpError::Timeout => TrackerError::Timeout,
            HttpError::Cancelled => TrackerError::Network("cancelled".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerProject {
    pub id: String,
    /// Short UPPERCASE key, e.g. `ACME`. This is the canonical project
    /// identifier across the whole sync engine.
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    /// `PROJ-NNN`.
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// One change delivered by the tracker's long-poll event feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerChange {
    pub project_identifier: String,
    #[serde(default)]
    pub issue_identifier: Option<String>,
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChangeFeed {
    #[serde(default)]
    changes: Vec<TrackerChange>,
    #[serde(default)]
    cursor: Option<String>,
}

/// Bound page size used when no `since` cursor is available.
const FULL_PAGE_LIMIT: u32 = 500;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrackerClient {
    pool: Arc<HttpPool>,
    base_url: String,
}

impl TrackerClient {
    pub fn new(pool: Arc<HttpPool>, base_url: impl Into<String>) -> Self {
        Self {
            pool,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// List all projects visible to the service account.
    pub async fn list_projects(&self) -> Result<Vec<TrackerProject>> {
        let req = self.pool.client().get(self.url("/api/projects"));
        let resp = self.pool.send("tracker", req).await?;
        resp.json::<Vec<TrackerProject>>()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))
    }

    /// List issues of a project. With `since`, only issues modified after
    /// that instant are fetched (incremental sync); otherwise one bounded
    /// full page.
    pub async fn list_issues(
        &self,
        project_identifier: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrackerIssue>> {
        let url = self.url(&format!("/api/projects/{project_identifier}/issues"));
        let mut req = self.pool.client().get(url);
        req = match since {
            Some(ts) => req.query(&[("since", ts.to_rfc3339())]),
            None => req.query(&[("limit", FULL_PAGE_LIMIT.to_string())]),
        };
        let resp = self.pool.send("tracker", req).await?;
        resp.json::<Vec<TrackerIssue>>()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))
    }

    pub async fn get_issue(&self, id: &str) -> Result<TrackerIssue> {
        let req = self.pool.client().get(self.url(&format!("/api/issues/{id}")));
        let resp = self.pool.send("tracker", req).await?;
        resp.json::<TrackerIssue>()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))
    }

    /// Update an issue's status to the given canonical tracker label.
    pub async fn update_issue_status(&self, id: &str, status: &str) -> Result<TrackerIssue> {
        self.pool.pace().await;
        let req = self
            .pool
            .client()
            .put(self.url(&format!("/api/issues/{id}")))
            .json(&serde_json::json!({ "status": status }));
        let resp = self.pool.send("tracker", req).await?;
        resp.json::<TrackerIssue>()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))
    }

    /// Replace an issue's description body (whole-field last-writer-wins).
    pub async fn update_issue_description(&self, id: &str, text: &str) -> Result<TrackerIssue> {
        self.pool.pace().await;
        let req = self
            .pool
            .client()
            .put(self.url(&format!("/api/issues/{id}")))
            .json(&serde_json::json!({ "description": text }));
        let resp = self.pool.send("tracker", req).await?;
        resp.json::<TrackerIssue>()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))
    }

    /// Long-poll the change feed. Blocks server-side up to ~30 s; returns
    /// the delivered changes and the next cursor.
    pub async fn poll_changes(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<TrackerChange>, Option<String>)> {
        let mut req = self.pool.client().get(self.url("/api/events"));
        if let Some(c) = cursor {
            req = req.query(&[("cursor", c)]);
        }
        let resp = self.pool.send("tracker", req).await?;
        let feed: ChangeFeed = resp
            .json()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))?;
        Ok((feed.changes, feed.cursor))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
