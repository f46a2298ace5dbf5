//! Adapter for the per-project local issue store: a `.issues/` directory
//! committed to the project repository, holding a JSONL export maintained by
//! the store's own CLI. Reads parse the export directly; every mutation
//! shells out to the CLI under a per-project mutex so invocations never
//! interleave.
//!
//! The adapter owns its mutex map. It nests inside the orchestrator's
//! project mutex (which is held for a whole reconciliation pass) and must
//! not be the same lock, or re-locking would deadlock.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use vs_core::mutexes::ProjectMutexes;

/// Marker subdirectory identifying a local issue store.
pub const MARKER_DIR: &str = ".issues";
/// JSONL export file inside the marker directory.
pub const EXPORT_FILE: &str = "issues.jsonl";

const DEFAULT_CLI: &str = "issuedb";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CLI failed: {0}")]
    Cli(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no local store at {0}")]
    Missing(PathBuf),
}

pub type Result<T> = std::result::Result<T, LocalStoreError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One issue row from the JSONL export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIssue {
    pub id: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Deserialize)]
struct CreatedIssue {
    id: String,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalStoreAdapter {
    cli_bin: String,
    mutexes: ProjectMutexes,
}

impl Default for LocalStoreAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStoreAdapter {
    pub fn new() -> Self {
        Self {
            cli_bin: DEFAULT_CLI.to_string(),
            mutexes: ProjectMutexes::new(),
        }
    }

    /// Use a specific CLI binary (tests point this at a stub).
    pub fn with_cli(cli_bin: impl Into<String>) -> Self {
        Self {
            cli_bin: cli_bin.into(),
            mutexes: ProjectMutexes::new(),
        }
    }

    /// Whether `path` hosts a local issue store.
    pub fn store_exists(path: &Path) -> bool {
        path.join(MARKER_DIR).is_dir()
    }

    /// Parse the JSONL export. Blank lines are skipped; a malformed line
    /// fails the whole read so divergence is loud rather than silent.
    pub async fn list_issues(&self, path: &Path) -> Result<Vec<LocalIssue>> {
        let export = path.join(MARKER_DIR).join(EXPORT_FILE);
        if !Self::store_exists(path) {
            return Err(LocalStoreError::Missing(path.to_path_buf()));
        }
        let raw = match tokio::fs::read_to_string(&export).await {
            Ok(raw) => raw,
            // A marker dir without an export yet is an empty store.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LocalStoreError::Io(e)),
        };
        let mut issues = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let issue: LocalIssue = serde_json::from_str(line)
                .map_err(|e| LocalStoreError::Parse(format!("line {}: {}", n + 1, e)))?;
            issues.push(issue);
        }
        Ok(issues)
    }

    /// Create an issue through the CLI and return its local id, which the
    /// caller binds back into the state store.
    pub async fn create_issue(
        &self,
        project: &str,
        path: &Path,
        title: &str,
        description: Option<&str>,
        status: &str,
    ) -> Result<String> {
        let mutex = self.mutexes.get(project);
        let _guard = mutex.lock().await;

        let mut args = vec![
            "create".to_string(),
            "--title".to_string(),
            title.to_string(),
            "--status".to_string(),
            status.to_string(),
            "--json".to_string(),
        ];
        if let Some(desc) = description {
            args.push("--description".to_string());
            args.push(desc.to_string());
        }

        let stdout = self.run_cli(path, &args).await?;
        let created: CreatedIssue = serde_json::from_str(stdout.trim())
            .map_err(|e| LocalStoreError::Parse(format!("create output: {e}")))?;
        debug!(project, local_id = %created.id, "local issue created");
        Ok(created.id)
    }

    pub async fn update_status(
        &self,
        project: &str,
        path: &Path,
        id: &str,
        status: &str,
    ) -> Result<()> {
        let mutex = self.mutexes.get(project);
        let _guard = mutex.lock().await;

        self.run_cli(
            path,
            &[
                "update".to_string(),
                id.to_string(),
                "--status".to_string(),
                status.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn close_issue(&self, project: &str, path: &Path, id: &str) -> Result<()> {
        let mutex = self.mutexes.get(project);
        let _guard = mutex.lock().await;

        self.run_cli(path, &["close".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    async fn run_cli(&self, path: &Path, args: &[String]) -> Result<String> {
        if !Self::store_exists(path) {
            return Err(LocalStoreError::Missing(path.to_path_buf()));
        }
        let output = Command::new(&self.cli_bin)
            .args(args)
            .current_dir(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LocalStoreError::Cli(format!(
                "{} {} exited with {}: {}",
                self.cli_bin,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(MARKER_DIR)).unwrap();
        dir
    }

    fn adapter() -> LocalStoreAdapter {
        LocalStoreAdapter::new()
    }

    #[tokio::test]
    async fn list_parses_jsonl_export() {
        let dir = store_dir();
        fs::write(
            dir.path().join(MARKER_DIR).join(EXPORT_FILE),
            concat!(
                "{\"id\":\"loc-1\",\"title\":\"Bootstrap\",\"status\":\"Backlog\"}\n",
                "\n",
                "{\"id\":\"loc-2\",\"title\":\"Deploy\",\"status\":\"Done\",\"closed\":true}\n",
            ),
        )
        .unwrap();

        let issues = adapter().list_issues(dir.path()).await.unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].id, "loc-1");
        assert!(!issues[0].closed);
        assert!(issues[1].closed);
    }

    #[tokio::test]
    async fn list_on_empty_store_is_empty() {
        let dir = store_dir();
        let issues = adapter().list_issues(dir.path()).await.unwrap();
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn missing_marker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = adapter().list_issues(dir.path()).await.unwrap_err();
        assert!(matches!(err, LocalStoreError::Missing(_)));
    }

    #[tokio::test]
    async fn malformed_line_fails_loudly() {
        let dir = store_dir();
        fs::write(
            dir.path().join(MARKER_DIR).join(EXPORT_FILE),
            "{\"id\":\"loc-1\",\"title\":\"ok\",\"status\":\"Backlog\"}\nnot json\n",
        )
        .unwrap();

        let err = adapter().list_issues(dir.path()).await.unwrap_err();
        match err {
            LocalStoreError::Parse(msg) => assert!(msg.contains("line 2")),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    mod cli {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write a stub CLI that echoes a canned JSON id and records its
        /// arguments.
        fn stub_cli(dir: &Path) -> String {
            let bin = dir.join("stub-issuedb");
            fs::write(
                &bin,
                "#!/bin/sh\necho \"$@\" >> args.log\necho '{\"id\":\"loc-9\"}'\n",
            )
            .unwrap();
            fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
            bin.to_string_lossy().into_owned()
        }

        #[tokio::test]
        async fn create_returns_cli_issue_id() {
            let dir = store_dir();
            let cli = stub_cli(dir.path());
            let adapter = LocalStoreAdapter::with_cli(cli);

            let id = adapter
                .create_issue("ACME", dir.path(), "Bootstrap", Some("desc"), "Backlog")
                .await
                .unwrap();
            assert_eq!(id, "loc-9");

            let log = fs::read_to_string(dir.path().join("args.log")).unwrap();
            assert!(log.contains("create"));
            assert!(log.contains("--status Backlog"));
            assert!(log.contains("--description desc"));
        }

        #[tokio::test]
        async fn update_and_close_invoke_cli() {
            let dir = store_dir();
            let cli = stub_cli(dir.path());
            let adapter = LocalStoreAdapter::with_cli(cli);

            adapter
                .update_status("ACME", dir.path(), "loc-9", "Done")
                .await
                .unwrap();
            adapter.close_issue("ACME", dir.path(), "loc-9").await.unwrap();

            let log = fs::read_to_string(dir.path().join("args.log")).unwrap();
            assert!(log.contains("update loc-9 --status Done"));
            assert!(log.contains("close loc-9"));
        }

        #[tokio::test]
        async fn failing_cli_surfaces_stderr() {
            let dir = store_dir();
            let bin = dir.path().join("failing");
            fs::write(&bin, "#!/bin/sh\necho 'boom' >&2\nexit 3\n").unwrap();
            fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
            let adapter = LocalStoreAdapter::with_cli(bin.to_string_lossy().into_owned());

            let err = adapter
                .close_issue("ACME", dir.path(), "loc-9")
                .await
                .unwrap_err();
            match err {
                LocalStoreError::Cli(msg) => assert!(msg.contains("boom")),
                other => panic!("expected Cli error, got {other:?}"),
            }
        }
    }
}
