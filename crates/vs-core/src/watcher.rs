//! Recursive filesystem watching for local issue stores and project
//! documentation trees. Raw notify events are mapped to the owning project
//! and emitted as debounced per-project batches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Configuration for a project watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet period a project must observe before its batch is emitted.
    pub debounce: Duration,
    /// Path substrings that never produce events.
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            ignore_patterns: vec![
                ".git".to_string(),
                "target".to_string(),
                "node_modules".to_string(),
                ".state".to_string(),
            ],
        }
    }
}

/// Watches a set of project roots and reports which projects changed, after
/// the per-project debounce window has settled.
pub struct ProjectWatcher {
    config: WatchConfig,
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
    /// Registered roots, longest path first so nested roots win.
    roots: Vec<(PathBuf, String)>,
    /// Projects with unflushed events and the time of their latest event.
    pending: HashMap<String, Instant>,
}

impl ProjectWatcher {
    pub fn new(config: WatchConfig) -> Result<Self, notify::Error> {
        let (tx, rx): (
            Sender<notify::Result<notify::Event>>,
            Receiver<notify::Result<notify::Event>>,
        ) = crossbeam_channel::unbounded();

        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        Ok(Self {
            config,
            watcher,
            rx,
            roots: Vec::new(),
            pending: HashMap::new(),
        })
    }

    /// Start watching a project's root recursively.
    pub fn watch_project(
        &mut self,
        identifier: &str,
        root: &Path,
    ) -> Result<(), notify::Error> {
        self.watcher.watch(root, RecursiveMode::Recursive)?;
        self.roots.push((root.to_path_buf(), identifier.to_string()));
        self.roots.sort_by(|a, b| b.0.as_os_str().len().cmp(&a.0.as_os_str().len()));
        Ok(())
    }

    /// Stop watching a project's root.
    pub fn unwatch_project(&mut self, root: &Path) -> Result<(), notify::Error> {
        self.watcher.unwatch(root)?;
        self.roots.retain(|(p, _)| p != root);
        Ok(())
    }

    pub fn watched_projects(&self) -> Vec<String> {
        self.roots.iter().map(|(_, ident)| ident.clone()).collect()
    }

    /// Drain raw events into the pending map, then return the projects whose
    /// debounce window has settled. Callers poll this on a short interval.
    pub fn poll_settled(&mut self) -> Vec<String> {
        self.drain_raw(Instant::now());
        self.take_settled(Instant::now())
    }

    /// Whether any project has unflushed events.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn drain_raw(&mut self, now: Instant) {
        while let Ok(result) = self.rx.try_recv() {
            let Ok(event) = result else { continue };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                continue;
            }
            for path in &event.paths {
                let path_str = path.to_string_lossy();
                if self
                    .config
                    .ignore_patterns
                    .iter()
                    .any(|pat| path_str.contains(pat.as_str()))
                {
                    continue;
                }
                if let Some(ident) = self.project_for(path) {
                    self.pending.insert(ident, now);
                }
            }
        }
    }

    fn take_settled(&mut self, now: Instant) -> Vec<String> {
        let debounce = self.config.debounce;
        let settled: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= debounce)
            .map(|(ident, _)| ident.clone())
            .collect();
        for ident in &settled {
            self.pending.remove(ident);
        }
        settled
    }

    fn project_for(&self, path: &Path) -> Option<String> {
        self.roots
            .iter()
            .find(|(root, _)| path.starts_with(root))
            .map(|(_, ident)| ident.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;

    fn quick_config() -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_millis(50),
            ignore_patterns: vec![".git".to_string()],
        }
    }

    #[test]
    fn default_config() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.debounce, Duration::from_secs(2));
        assert!(cfg.ignore_patterns.contains(&".git".to_string()));
    }

    #[test]
    fn maps_change_to_project_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ProjectWatcher::new(quick_config()).unwrap();
        w.watch_project("ACME", dir.path()).unwrap();

        fs::write(dir.path().join("notes.md"), "hello").unwrap();
        thread::sleep(Duration::from_millis(300));

        // First poll registers the event; the debounce window may or may not
        // have settled depending on delivery timing, so poll until it does.
        let mut settled = w.poll_settled();
        for _ in 0..20 {
            if !settled.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
            settled = w.poll_settled();
        }
        assert_eq!(settled, vec!["ACME".to_string()]);
        assert!(!w.has_pending());
    }

    #[test]
    fn ignored_paths_produce_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        fs::create_dir_all(&git).unwrap();

        let mut w = ProjectWatcher::new(quick_config()).unwrap();
        w.watch_project("ACME", dir.path()).unwrap();

        fs::write(git.join("HEAD"), "ref").unwrap();
        thread::sleep(Duration::from_millis(300));

        let mut any = Vec::new();
        for _ in 0..5 {
            any.extend(w.poll_settled());
            thread::sleep(Duration::from_millis(50));
        }
        assert!(any.is_empty(), "expected no events for ignored path, got {any:?}");
    }

    #[test]
    fn nested_roots_resolve_to_longest_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub");
        fs::create_dir_all(&nested).unwrap();

        let mut w = ProjectWatcher::new(quick_config()).unwrap();
        w.watch_project("OUTER", dir.path()).unwrap();
        w.watch_project("INNER", &nested).unwrap();

        assert_eq!(w.project_for(&nested.join("x.md")), Some("INNER".to_string()));
        assert_eq!(
            w.project_for(&dir.path().join("y.md")),
            Some("OUTER".to_string())
        );
    }

    #[test]
    fn watched_projects_lists_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ProjectWatcher::new(quick_config()).unwrap();
        w.watch_project("ACME", dir.path()).unwrap();
        assert_eq!(w.watched_projects(), vec!["ACME".to_string()]);
        w.unwatch_project(dir.path()).unwrap();
        assert!(w.watched_projects().is_empty());
    }
}
