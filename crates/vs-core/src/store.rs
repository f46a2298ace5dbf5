use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tokio_rusqlite::Connection;

use crate::types::{
    normalize_title, AgentBinding, Issue, Project, ProjectState, SyncRun,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the state store. `Busy` is the only retriable kind;
/// callers treat `Schema` at startup as fatal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store busy")]
    Busy,
    #[error("schema error: {0}")]
    Schema(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::Rusqlite(inner) => StoreError::from(inner),
            other => StoreError::Schema(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("row".to_string()),
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Busy
            }
            _ => StoreError::Schema(e.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed state store: one row per canonical project and issue,
/// agent bindings with per-block content hashes, and append-only sync-run
/// history. Idempotent upserts are the only mutation path.
pub struct StateStore {
    conn: Connection,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    })
}

fn state_to_sql(state: ProjectState) -> &'static str {
    match state {
        ProjectState::Active => "active",
        ProjectState::Empty => "empty",
    }
}

fn state_from_sql(raw: &str) -> ProjectState {
    match raw {
        "empty" => ProjectState::Empty,
        _ => ProjectState::Active,
    }
}

impl StateStore {
    /// Open (or create) the store at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Purely in-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS projects (
                        identifier        TEXT PRIMARY KEY,
                        name              TEXT NOT NULL,
                        tracker_id        TEXT,
                        board_id          TEXT,
                        filesystem_path   TEXT,
                        git_url           TEXT,
                        description_hash  TEXT,
                        last_sync_at      TEXT,
                        issue_count       INTEGER NOT NULL DEFAULT 0,
                        state             TEXT NOT NULL DEFAULT 'active'
                    );

                    CREATE TABLE IF NOT EXISTS issues (
                        identifier          TEXT PRIMARY KEY,
                        project_identifier  TEXT NOT NULL
                            REFERENCES projects(identifier) ON DELETE CASCADE,
                        title               TEXT NOT NULL,
                        description         TEXT,
                        status              TEXT NOT NULL,
                        priority            TEXT,
                        tracker_id          TEXT,
                        board_task_id       TEXT,
                        local_store_id      TEXT,
                        tracker_status      TEXT,
                        board_status        TEXT,
                        local_status        TEXT,
                        tracker_modified_at TEXT,
                        board_modified_at   TEXT,
                        local_modified_at   TEXT,
                        description_hash    TEXT,
                        updated_at          TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_issues_project
                        ON issues(project_identifier);
                    CREATE INDEX IF NOT EXISTS idx_issues_project_status
                        ON issues(project_identifier, status);

                    CREATE TABLE IF NOT EXISTS agent_bindings (
                        project_identifier TEXT PRIMARY KEY
                            REFERENCES projects(identifier) ON DELETE CASCADE,
                        agent_id           TEXT NOT NULL,
                        folder_id          TEXT,
                        source_id          TEXT,
                        agent_last_sync_at TEXT
                    );

                    CREATE TABLE IF NOT EXISTS block_hashes (
                        project_identifier TEXT NOT NULL
                            REFERENCES projects(identifier) ON DELETE CASCADE,
                        block_label        TEXT NOT NULL,
                        content_hash       TEXT NOT NULL,
                        PRIMARY KEY (project_identifier, block_label)
                    );

                    CREATE TABLE IF NOT EXISTS sync_runs (
                        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                        started_at         TEXT NOT NULL,
                        completed_at       TEXT,
                        projects_processed INTEGER NOT NULL DEFAULT 0,
                        projects_failed    INTEGER NOT NULL DEFAULT 0,
                        issues_synced      INTEGER NOT NULL DEFAULT 0,
                        errors_json        TEXT NOT NULL DEFAULT '{}',
                        duration_ms        INTEGER
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Idempotent project upsert. If another row already carries the same
    /// tracker id under a different identifier (a rename observed upstream),
    /// its fields are merged into the canonical row, its issues re-pointed,
    /// and the duplicate deleted -- all in one transaction.
    pub async fn upsert_project(&self, project: &Project) -> Result<()> {
        let p = project.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let mut merged = p.clone();
                if let Some(tracker_id) = &p.tracker_id {
                    let dup: Option<Project> = {
                        let mut stmt = tx.prepare(
                            "SELECT identifier, name, tracker_id, board_id, filesystem_path,
                                    git_url, description_hash, last_sync_at, issue_count, state
                             FROM projects WHERE tracker_id = ?1 AND identifier != ?2",
                        )?;
                        let mut rows =
                            stmt.query(rusqlite::params![tracker_id, p.identifier])?;
                        match rows.next()? {
                            Some(row) => Some(row_to_project(row)?),
                            None => None,
                        }
                    };
                    if let Some(dup) = dup {
                        tracing::warn!(
                            canonical = %p.identifier,
                            duplicate = %dup.identifier,
                            "project rename collision, merging rows"
                        );
                        merged.board_id = merged.board_id.or(dup.board_id);
                        merged.filesystem_path = merged.filesystem_path.or(dup.filesystem_path);
                        merged.git_url = merged.git_url.or(dup.git_url);
                        merged.description_hash =
                            merged.description_hash.or(dup.description_hash);
                        merged.last_sync_at = merged.last_sync_at.or(dup.last_sync_at);
                        tx.execute(
                            "UPDATE issues SET project_identifier = ?1
                             WHERE project_identifier = ?2",
                            rusqlite::params![p.identifier, dup.identifier],
                        )?;
                        tx.execute(
                            "DELETE FROM projects WHERE identifier = ?1",
                            rusqlite::params![dup.identifier],
                        )?;
                    }
                }

                tx.execute(
                    "INSERT INTO projects (identifier, name, tracker_id, board_id,
                        filesystem_path, git_url, description_hash, last_sync_at,
                        issue_count, state)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(identifier) DO UPDATE SET
                        name=excluded.name,
                        tracker_id=COALESCE(excluded.tracker_id, projects.tracker_id),
                        board_id=COALESCE(excluded.board_id, projects.board_id),
                        filesystem_path=COALESCE(excluded.filesystem_path, projects.filesystem_path),
                        git_url=COALESCE(excluded.git_url, projects.git_url),
                        description_hash=COALESCE(excluded.description_hash, projects.description_hash),
                        last_sync_at=COALESCE(excluded.last_sync_at, projects.last_sync_at),
                        issue_count=excluded.issue_count,
                        state=excluded.state",
                    rusqlite::params![
                        merged.identifier,
                        merged.name,
                        merged.tracker_id,
                        merged.board_id,
                        merged.filesystem_path,
                        merged.git_url,
                        merged.description_hash,
                        opt_ts(&merged.last_sync_at),
                        merged.issue_count,
                        state_to_sql(merged.state),
                    ],
                )?;

                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_project(&self, identifier: &str) -> Result<Option<Project>> {
        let ident = identifier.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identifier, name, tracker_id, board_id, filesystem_path,
                            git_url, description_hash, last_sync_at, issue_count, state
                     FROM projects WHERE identifier = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![ident])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identifier, name, tracker_id, board_id, filesystem_path,
                            git_url, description_hash, last_sync_at, issue_count, state
                     FROM projects ORDER BY identifier",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_project(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Projects due for a sync: active ones whose `last_sync_at` is older
    /// than the sync interval (or never set), and empty ones whose skip-cache
    /// TTL has expired.
    pub async fn projects_needing_sync(
        &self,
        sync_interval: Duration,
        empty_ttl: Duration,
    ) -> Result<Vec<Project>> {
        let now = Utc::now();
        let active_cutoff = ts(&(now - sync_interval));
        let empty_cutoff = ts(&(now - empty_ttl));
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identifier, name, tracker_id, board_id, filesystem_path,
                            git_url, description_hash, last_sync_at, issue_count, state
                     FROM projects
                     WHERE (state = 'active'
                            AND (last_sync_at IS NULL OR last_sync_at < ?1))
                        OR (state = 'empty'
                            AND (last_sync_at IS NULL OR last_sync_at < ?2))
                     ORDER BY identifier",
                )?;
                let mut rows = stmt.query(rusqlite::params![active_cutoff, empty_cutoff])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_project(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_project(&self, identifier: &str) -> Result<bool> {
        let ident = identifier.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM projects WHERE identifier = ?1",
                    rusqlite::params![ident],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn project_count(&self) -> Result<u64> {
        self.conn
            .call(|conn| {
                let n: u64 = conn
                    .prepare("SELECT COUNT(*) FROM projects")?
                    .query_row([], |r| r.get(0))?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    /// Idempotent issue upsert. Binding ids (tracker/board/local) are filled
    /// in place and never cleared by an upsert carrying `None`.
    pub async fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        let i = issue.clone();
        self.conn
            .call(move |conn| {
                upsert_issue_inner(conn, &i)?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Upsert a batch of issues in a single transaction.
    pub async fn upsert_issues(&self, issues: &[Issue]) -> Result<()> {
        let batch: Vec<Issue> = issues.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for issue in &batch {
                    upsert_issue_inner(&tx, issue)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_issue(&self, identifier: &str) -> Result<Option<Issue>> {
        let ident = identifier.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ISSUE_COLS} FROM issues WHERE identifier = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![ident])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_issue(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn issues_for_project(&self, project: &str) -> Result<Vec<Issue>> {
        let project = project.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ISSUE_COLS} FROM issues
                     WHERE project_identifier = ?1 ORDER BY identifier"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_issue(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn issues_by_status(&self, project: &str, status: &str) -> Result<Vec<Issue>> {
        let project = project.to_string();
        let status = status.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ISSUE_COLS} FROM issues
                     WHERE project_identifier = ?1 AND status = ?2 ORDER BY identifier"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project, status])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_issue(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Find an issue by `(project, normalized title)`. Used to bind source
    /// ids onto an existing row instead of creating a duplicate.
    pub async fn find_issue_by_title(
        &self,
        project: &str,
        title: &str,
    ) -> Result<Option<Issue>> {
        let wanted = normalize_title(title);
        let issues = self.issues_for_project(project).await?;
        Ok(issues
            .into_iter()
            .find(|i| normalize_title(&i.title) == wanted))
    }

    /// Unbind an issue from its board task (the task vanished board-side);
    /// the next pass recreates it. Upserts coalesce binding columns, so
    /// clearing needs an explicit statement.
    pub async fn clear_board_binding(&self, identifier: &str) -> Result<()> {
        let ident = identifier.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE issues SET board_task_id=NULL, board_status=NULL,
                        board_modified_at=NULL
                     WHERE identifier = ?1",
                    rusqlite::params![ident],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Unbind an issue from its local-store row.
    pub async fn clear_local_binding(&self, identifier: &str) -> Result<()> {
        let ident = identifier.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE issues SET local_store_id=NULL, local_status=NULL,
                        local_modified_at=NULL
                     WHERE identifier = ?1",
                    rusqlite::params![ident],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_issue(&self, identifier: &str) -> Result<bool> {
        let ident = identifier.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM issues WHERE identifier = ?1",
                    rusqlite::params![ident],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Agent bindings & block hashes
    // -----------------------------------------------------------------------

    pub async fn upsert_binding(&self, binding: &AgentBinding) -> Result<()> {
        let b = binding.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_bindings
                        (project_identifier, agent_id, folder_id, source_id, agent_last_sync_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(project_identifier) DO UPDATE SET
                        agent_id=excluded.agent_id,
                        folder_id=COALESCE(excluded.folder_id, agent_bindings.folder_id),
                        source_id=COALESCE(excluded.source_id, agent_bindings.source_id),
                        agent_last_sync_at=COALESCE(excluded.agent_last_sync_at,
                                                    agent_bindings.agent_last_sync_at)",
                    rusqlite::params![
                        b.project_identifier,
                        b.agent_id,
                        b.folder_id,
                        b.source_id,
                        opt_ts(&b.agent_last_sync_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_binding(&self, project: &str) -> Result<Option<AgentBinding>> {
        let project = project.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_identifier, agent_id, folder_id, source_id,
                            agent_last_sync_at
                     FROM agent_bindings WHERE project_identifier = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project])?;
                match rows.next()? {
                    Some(row) => Ok(Some(AgentBinding {
                        project_identifier: row.get(0)?,
                        agent_id: row.get(1)?,
                        folder_id: row.get(2)?,
                        source_id: row.get(3)?,
                        agent_last_sync_at: parse_ts(row.get(4)?),
                    })),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Drop a binding (e.g. when it turned out to point at a sleep-time
    /// agent). Block hashes for the project are dropped with it so the next
    /// sync re-writes all blocks on the fresh agent.
    pub async fn delete_binding(&self, project: &str) -> Result<bool> {
        let project = project.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM block_hashes WHERE project_identifier = ?1",
                    rusqlite::params![project],
                )?;
                let n = tx.execute(
                    "DELETE FROM agent_bindings WHERE project_identifier = ?1",
                    rusqlite::params![project],
                )?;
                tx.commit()?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_block_hash(
        &self,
        project: &str,
        label: &str,
        hash: &str,
    ) -> Result<()> {
        let project = project.to_string();
        let label = label.to_string();
        let hash = hash.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO block_hashes (project_identifier, block_label, content_hash)
                     VALUES (?1,?2,?3)
                     ON CONFLICT(project_identifier, block_label) DO UPDATE SET
                        content_hash=excluded.content_hash",
                    rusqlite::params![project, label, hash],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_block_hashes(&self, project: &str) -> Result<BTreeMap<String, String>> {
        let project = project.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT block_label, content_hash FROM block_hashes
                     WHERE project_identifier = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project])?;
                let mut out = BTreeMap::new();
                while let Some(row) = rows.next()? {
                    out.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Sync runs
    // -----------------------------------------------------------------------

    /// Open a new sync-run record, returning its id.
    pub async fn begin_run(&self) -> Result<i64> {
        let started = ts(&Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_runs (started_at) VALUES (?1)",
                    rusqlite::params![started],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Close a sync-run record with its final counters and per-project
    /// errors.
    pub async fn complete_run(
        &self,
        id: i64,
        processed: u32,
        failed: u32,
        issues_synced: u32,
        errors: &BTreeMap<String, String>,
        duration_ms: i64,
    ) -> Result<()> {
        let completed = ts(&Utc::now());
        let errors_json =
            serde_json::to_string(errors).map_err(|e| StoreError::Schema(e.to_string()))?;
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE sync_runs SET completed_at=?1, projects_processed=?2,
                        projects_failed=?3, issues_synced=?4, errors_json=?5,
                        duration_ms=?6
                     WHERE id=?7",
                    rusqlite::params![
                        completed,
                        processed,
                        failed,
                        issues_synced,
                        errors_json,
                        duration_ms,
                        id
                    ],
                )?;
                if n == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows.into());
                }
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Most recent runs, newest first.
    pub async fn last_runs(&self, limit: u32) -> Result<Vec<SyncRun>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, started_at, completed_at, projects_processed,
                            projects_failed, issues_synced, errors_json, duration_ms
                     FROM sync_runs ORDER BY id DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_run(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Retain only the newest `keep` runs.
    pub async fn prune_runs(&self, keep: u32) -> Result<usize> {
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM sync_runs WHERE id NOT IN
                        (SELECT id FROM sync_runs ORDER BY id DESC LIMIT ?1)",
                    rusqlite::params![keep],
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const ISSUE_COLS: &str = "identifier, project_identifier, title, description, status, \
    priority, tracker_id, board_task_id, local_store_id, tracker_status, board_status, \
    local_status, tracker_modified_at, board_modified_at, local_modified_at, \
    description_hash, updated_at";

fn upsert_issue_inner(conn: &rusqlite::Connection, i: &Issue) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO issues (identifier, project_identifier, title, description, status,
            priority, tracker_id, board_task_id, local_store_id, tracker_status,
            board_status, local_status, tracker_modified_at, board_modified_at,
            local_modified_at, description_hash, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
         ON CONFLICT(identifier) DO UPDATE SET
            project_identifier=excluded.project_identifier,
            title=excluded.title,
            description=COALESCE(excluded.description, issues.description),
            status=excluded.status,
            priority=COALESCE(excluded.priority, issues.priority),
            tracker_id=COALESCE(excluded.tracker_id, issues.tracker_id),
            board_task_id=COALESCE(excluded.board_task_id, issues.board_task_id),
            local_store_id=COALESCE(excluded.local_store_id, issues.local_store_id),
            tracker_status=COALESCE(excluded.tracker_status, issues.tracker_status),
            board_status=COALESCE(excluded.board_status, issues.board_status),
            local_status=COALESCE(excluded.local_status, issues.local_status),
            tracker_modified_at=COALESCE(excluded.tracker_modified_at, issues.tracker_modified_at),
            board_modified_at=COALESCE(excluded.board_modified_at, issues.board_modified_at),
            local_modified_at=COALESCE(excluded.local_modified_at, issues.local_modified_at),
            description_hash=COALESCE(excluded.description_hash, issues.description_hash),
            updated_at=excluded.updated_at",
        rusqlite::params![
            i.identifier,
            i.project_identifier,
            i.title,
            i.description,
            i.status,
            i.priority,
            i.tracker_id,
            i.board_task_id,
            i.local_store_id,
            i.tracker_status,
            i.board_status,
            i.local_status,
            opt_ts(&i.tracker_modified_at),
            opt_ts(&i.board_modified_at),
            opt_ts(&i.local_modified_at),
            i.description_hash,
            ts(&i.updated_at),
        ],
    )?;
    Ok(())
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let state_str: String = row.get(9)?;
    Ok(Project {
        identifier: row.get(0)?,
        name: row.get(1)?,
        tracker_id: row.get(2)?,
        board_id: row.get(3)?,
        filesystem_path: row.get(4)?,
        git_url: row.get(5)?,
        description_hash: row.get(6)?,
        last_sync_at: parse_ts(row.get(7)?),
        issue_count: row.get(8)?,
        state: state_from_sql(&state_str),
    })
}

fn row_to_issue(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    Ok(Issue {
        identifier: row.get(0)?,
        project_identifier: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        tracker_id: row.get(6)?,
        board_task_id: row.get(7)?,
        local_store_id: row.get(8)?,
        tracker_status: row.get(9)?,
        board_status: row.get(10)?,
        local_status: row.get(11)?,
        tracker_modified_at: parse_ts(row.get(12)?),
        board_modified_at: parse_ts(row.get(13)?),
        local_modified_at: parse_ts(row.get(14)?),
        description_hash: row.get(15)?,
        updated_at: parse_ts(row.get(16)?).unwrap_or_else(Utc::now),
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRun> {
    let errors_json: String = row.get(6)?;
    Ok(SyncRun {
        id: row.get(0)?,
        started_at: parse_ts(row.get(1)?).unwrap_or_else(Utc::now),
        completed_at: parse_ts(row.get(2)?),
        projects_processed: row.get(3)?,
        projects_failed: row.get(4)?,
        issues_synced: row.get(5)?,
        errors: serde_json::from_str(&errors_json).unwrap_or_default(),
        duration_ms: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> StateStore {
        StateStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn project_upsert_roundtrip() {
        let s = store().await;
        let mut p = Project::new("ACME", "Acme Corp");
        p.tracker_id = Some("trk-1".into());
        s.upsert_project(&p).await.unwrap();

        let loaded = s.get_project("ACME").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Acme Corp");
        assert_eq!(loaded.tracker_id.as_deref(), Some("trk-1"));
        assert_eq!(loaded.state, ProjectState::Active);

        // Second upsert with a bound board id fills in place.
        p.board_id = Some("brd-7".into());
        s.upsert_project(&p).await.unwrap();
        let loaded = s.get_project("ACME").await.unwrap().unwrap();
        assert_eq!(loaded.board_id.as_deref(), Some("brd-7"));
        assert_eq!(s.project_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_does_not_clear_bound_fields() {
        let s = store().await;
        let mut p = Project::new("ACME", "Acme");
        p.board_id = Some("brd-7".into());
        s.upsert_project(&p).await.unwrap();

        // A later observation without the board id must not unbind it.
        let bare = Project::new("ACME", "Acme");
        s.upsert_project(&bare).await.unwrap();
        let loaded = s.get_project("ACME").await.unwrap().unwrap();
        assert_eq!(loaded.board_id.as_deref(), Some("brd-7"));
    }

    #[tokio::test]
    async fn rename_collision_merges_and_deletes_duplicate() {
        let s = store().await;
        let mut old = Project::new("OLD", "Old Name");
        old.tracker_id = Some("trk-1".into());
        old.board_id = Some("brd-1".into());
        s.upsert_project(&old).await.unwrap();
        s.upsert_issue(&Issue::new("OLD-1", "OLD", "Carry me", "Backlog"))
            .await
            .unwrap();

        let mut renamed = Project::new("NEW", "New Name");
        renamed.tracker_id = Some("trk-1".into());
        s.upsert_project(&renamed).await.unwrap();

        assert!(s.get_project("OLD").await.unwrap().is_none());
        let canonical = s.get_project("NEW").await.unwrap().unwrap();
        // Fields from the older row survive on the canonical one.
        assert_eq!(canonical.board_id.as_deref(), Some("brd-1"));
        // The issue followed the merge instead of cascading away.
        let issue = s.get_issue("OLD-1").await.unwrap().unwrap();
        assert_eq!(issue.project_identifier, "NEW");
    }

    #[tokio::test]
    async fn issue_upsert_binds_in_place() {
        let s = store().await;
        s.upsert_project(&Project::new("ACME", "Acme")).await.unwrap();

        let mut i = Issue::new("ACME-1", "ACME", "Bootstrap", "Backlog");
        i.tracker_id = Some("t-1".into());
        s.upsert_issue(&i).await.unwrap();

        // Board discovers the same issue: only the board id is added.
        let mut update = Issue::new("ACME-1", "ACME", "Bootstrap", "Backlog");
        update.board_task_id = Some("task-9".into());
        update.board_status = Some("todo".into());
        s.upsert_issue(&update).await.unwrap();

        let loaded = s.get_issue("ACME-1").await.unwrap().unwrap();
        assert_eq!(loaded.tracker_id.as_deref(), Some("t-1"));
        assert_eq!(loaded.board_task_id.as_deref(), Some("task-9"));
        assert_eq!(loaded.board_status.as_deref(), Some("todo"));

        let all = s.issues_for_project("ACME").await.unwrap();
        assert_eq!(all.len(), 1, "one row per identifier");
    }

    #[tokio::test]
    async fn find_issue_by_normalized_title() {
        let s = store().await;
        s.upsert_project(&Project::new("ACME", "Acme")).await.unwrap();
        s.upsert_issue(&Issue::new("ACME-2", "ACME", "Fix  the   Widget", "Backlog"))
            .await
            .unwrap();

        let hit = s
            .find_issue_by_title("ACME", " fix the widget ")
            .await
            .unwrap();
        assert_eq!(hit.unwrap().identifier, "ACME-2");
        assert!(s
            .find_issue_by_title("ACME", "something else")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn issues_by_status_filter() {
        let s = store().await;
        s.upsert_project(&Project::new("ACME", "Acme")).await.unwrap();
        s.upsert_issues(&[
            Issue::new("ACME-1", "ACME", "A", "Backlog"),
            Issue::new("ACME-2", "ACME", "B", "Done"),
            Issue::new("ACME-3", "ACME", "C", "Backlog"),
        ])
        .await
        .unwrap();

        let backlog = s.issues_by_status("ACME", "Backlog").await.unwrap();
        assert_eq!(backlog.len(), 2);
        let done = s.issues_by_status("ACME", "Done").await.unwrap();
        assert_eq!(done.len(), 1);
    }

    #[tokio::test]
    async fn projects_needing_sync_honors_interval_and_ttl() {
        let s = store().await;
        let mut fresh = Project::new("FRESH", "Fresh");
        fresh.last_sync_at = Some(Utc::now());
        let mut stale = Project::new("STALE", "Stale");
        stale.last_sync_at = Some(Utc::now() - Duration::minutes(10));
        let mut empty = Project::new("EMPTY", "Empty");
        empty.state = ProjectState::Empty;
        empty.last_sync_at = Some(Utc::now() - Duration::minutes(10));
        let never = Project::new("NEVER", "Never synced");

        for p in [&fresh, &stale, &empty, &never] {
            s.upsert_project(p).await.unwrap();
        }

        let due = s
            .projects_needing_sync(Duration::minutes(1), Duration::hours(1))
            .await
            .unwrap();
        let idents: Vec<&str> = due.iter().map(|p| p.identifier.as_str()).collect();
        assert!(idents.contains(&"STALE"));
        assert!(idents.contains(&"NEVER"));
        assert!(!idents.contains(&"FRESH"), "recently synced is not due");
        assert!(!idents.contains(&"EMPTY"), "empty project inside TTL is skipped");

        // Once the empty TTL expires the project is due again.
        let due = s
            .projects_needing_sync(Duration::minutes(1), Duration::minutes(5))
            .await
            .unwrap();
        assert!(due.iter().any(|p| p.identifier == "EMPTY"));
    }

    #[tokio::test]
    async fn binding_and_block_hashes() {
        let s = store().await;
        s.upsert_project(&Project::new("ACME", "Acme")).await.unwrap();

        let mut b = AgentBinding::new("ACME", "agent-1");
        b.folder_id = Some("folder-1".into());
        s.upsert_binding(&b).await.unwrap();
        s.set_block_hash("ACME", "project", "abc123").await.unwrap();
        s.set_block_hash("ACME", "board_metrics", "def456").await.unwrap();

        let loaded = s.get_binding("ACME").await.unwrap().unwrap();
        assert_eq!(loaded.agent_id, "agent-1");
        assert_eq!(loaded.folder_id.as_deref(), Some("folder-1"));

        let hashes = s.get_block_hashes("ACME").await.unwrap();
        assert_eq!(hashes.get("project").map(String::as_str), Some("abc123"));
        assert_eq!(hashes.len(), 2);

        // Discarding the binding clears the hashes with it.
        assert!(s.delete_binding("ACME").await.unwrap());
        assert!(s.get_binding("ACME").await.unwrap().is_none());
        assert!(s.get_block_hashes("ACME").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_run_lifecycle() {
        let s = store().await;
        let id = s.begin_run().await.unwrap();

        let mut errors = BTreeMap::new();
        errors.insert("ACME".to_string(), "tracker timeout".to_string());
        s.complete_run(id, 3, 1, 12, &errors, 4200).await.unwrap();

        let runs = s.last_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.id, id);
        assert_eq!(run.projects_processed, 3);
        assert_eq!(run.projects_failed, 1);
        assert_eq!(run.issues_synced, 12);
        assert_eq!(run.duration_ms, Some(4200));
        assert_eq!(run.errors.get("ACME").map(String::as_str), Some("tracker timeout"));
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn prune_runs_keeps_newest() {
        let s = store().await;
        for _ in 0..5 {
            let id = s.begin_run().await.unwrap();
            s.complete_run(id, 0, 0, 0, &BTreeMap::new(), 1).await.unwrap();
        }
        let removed = s.prune_runs(2).await.unwrap();
        assert_eq!(removed, 3);
        let runs = s.last_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].id > runs[1].id);
    }

    #[tokio::test]
    async fn complete_unknown_run_is_not_found() {
        let s = store().await;
        let err = s
            .complete_run(999, 0, 0, 0, &BTreeMap::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn clearing_bindings_nulls_the_columns() {
        let s = store().await;
        s.upsert_project(&Project::new("ACME", "Acme")).await.unwrap();
        let mut i = Issue::new("ACME-1", "ACME", "A", "Backlog");
        i.board_task_id = Some("task-1".into());
        i.board_status = Some("todo".into());
        i.local_store_id = Some("loc-1".into());
        s.upsert_issue(&i).await.unwrap();

        s.clear_board_binding("ACME-1").await.unwrap();
        let loaded = s.get_issue("ACME-1").await.unwrap().unwrap();
        assert!(loaded.board_task_id.is_none());
        assert!(loaded.board_status.is_none());
        assert_eq!(loaded.local_store_id.as_deref(), Some("loc-1"));

        s.clear_local_binding("ACME-1").await.unwrap();
        let loaded = s.get_issue("ACME-1").await.unwrap().unwrap();
        assert!(loaded.local_store_id.is_none());
    }

    #[tokio::test]
    async fn deleting_project_cascades_to_issues() {
        let s = store().await;
        s.upsert_project(&Project::new("ACME", "Acme")).await.unwrap();
        s.upsert_issue(&Issue::new("ACME-1", "ACME", "A", "Backlog"))
            .await
            .unwrap();
        assert!(s.delete_project("ACME").await.unwrap());
        assert!(s.get_issue("ACME-1").await.unwrap().is_none());
    }
}
