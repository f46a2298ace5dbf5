//! Per-project mutual exclusion. All intra-project mutation (orchestrator
//! phases, local-store CLI calls) happens under the project's mutex; the map
//! lazily creates entries inside a short critical section.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Map of `project identifier → mutex`. Clones share the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ProjectMutexes {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectMutexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or lazily create) the mutex for a project. The returned Arc can
    /// be locked outside any map lock.
    pub fn get(&self, identifier: &str) -> Arc<Mutex<()>> {
        self.inner
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of known projects (for diagnostics).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_project_same_mutex() {
        let m = ProjectMutexes::new();
        let a = m.get("ACME");
        let b = m.get("ACME");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.len(), 1);
    }

    #[tokio::test]
    async fn distinct_projects_do_not_contend() {
        let m = ProjectMutexes::new();
        let a = m.get("ACME");
        let b = m.get("OTHER");
        let _ga = a.lock().await;
        // Locking a different project's mutex must not block.
        let _gb = b.lock().await;
    }

    #[tokio::test]
    async fn mutex_serializes_same_project() {
        let m = ProjectMutexes::new();
        let mutex = m.get("ACME");
        let guard = mutex.lock().await;
        assert!(m.get("ACME").try_lock().is_err());
        drop(guard);
        assert!(m.get("ACME").try_lock().is_ok());
    }
}
