//! Global sync serialization: one sync run at a time, coalescing debounce
//! for event bursts, a hard per-run timeout, and re-trigger-on-completion
//! when events arrive mid-run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vs_core::store::StateStore;

use crate::orchestrator::{RunReport, SyncError, SyncOrchestrator};

/// Default coalescing debounce for trigger bursts.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
/// Default hard ceiling for one sync run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(900);
/// Bounded sync-run history kept in the store.
const RUN_HISTORY_KEEP: u32 = 500;

/// Result of asking for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Enqueued; a run will start after the debounce window.
    Accepted,
    /// A trigger inside the debounce window; the pending run covers it.
    Coalesced,
    /// A run is in flight; a resync was requested for when it completes.
    AlreadyRunning,
}

/// The thing the controller runs. `SyncOrchestrator` in production; tests
/// substitute a stub.
#[async_trait]
pub trait SyncRunner: Send + Sync + 'static {
    async fn run_sync(&self, cancel: &CancellationToken) -> Result<RunReport, SyncError>;
}

#[async_trait]
impl SyncRunner for SyncOrchestrator {
    async fn run_sync(&self, cancel: &CancellationToken) -> Result<RunReport, SyncError> {
        SyncOrchestrator::run_sync(self, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SyncController {
    runner: Arc<dyn SyncRunner>,
    store: Arc<StateStore>,
    in_progress: AtomicBool,
    resync_requested: AtomicBool,
    tx: flume::Sender<String>,
    rx: flume::Receiver<String>,
    last_accepted: StdMutex<Option<Instant>>,
    debounce: Duration,
    run_timeout: Duration,
}

impl SyncController {
    pub fn new(runner: Arc<dyn SyncRunner>, store: Arc<StateStore>) -> Arc<Self> {
        Self::with_timing(runner, store, DEFAULT_DEBOUNCE, DEFAULT_RUN_TIMEOUT)
    }

    pub fn with_timing(
        runner: Arc<dyn SyncRunner>,
        store: Arc<StateStore>,
        debounce: Duration,
        run_timeout: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self {
            runner,
            store,
            in_progress: AtomicBool::new(false),
            resync_requested: AtomicBool::new(false),
            tx,
            rx,
            last_accepted: StdMutex::new(None),
            debounce,
            run_timeout,
        })
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Ask for a sync. Never blocks; the run itself happens on the
    /// controller's loop.
    pub fn trigger_sync(&self, source: &str) -> TriggerOutcome {
        if self.in_progress.load(Ordering::SeqCst) {
            self.resync_requested.store(true, Ordering::SeqCst);
            info!(source, "sync already in progress, resync requested");
            return TriggerOutcome::AlreadyRunning;
        }

        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(at) = *last {
            if at.elapsed() < self.debounce {
                return TriggerOutcome::Coalesced;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        if self.tx.send(source.to_string()).is_err() {
            warn!(source, "controller loop gone, trigger dropped");
            return TriggerOutcome::Coalesced;
        }
        info!(source, "sync triggered");
        TriggerOutcome::Accepted
    }

    /// Run the controller loop until cancelled. Spawned once by the daemon.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let ctl = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let source = tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = ctl.rx.recv_async() => match recv {
                        Ok(s) => s,
                        Err(_) => break,
                    },
                };

                // Coalesce the burst: wait out the debounce window, then
                // drain everything that queued up behind this trigger.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctl.debounce) => {}
                }
                while ctl.rx.try_recv().is_ok() {}

                ctl.execute_run(&source, &cancel).await;

                if ctl.resync_requested.swap(false, Ordering::SeqCst) {
                    let _ = ctl.tx.send("resync".to_string());
                }
            }
            info!("sync controller stopped");
        })
    }

    async fn execute_run(&self, source: &str, cancel: &CancellationToken) {
        self.in_progress.store(true, Ordering::SeqCst);
        let metrics = vs_telemetry::global_metrics();
        metrics.set_gauge("sync_in_progress", 1);

        let run_id = match self.store.begin_run().await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "failed to open sync-run record");
                None
            }
        };

        let started = Instant::now();
        let child = cancel.child_token();
        let outcome = tokio::time::timeout(self.run_timeout, self.runner.run_sync(&child)).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        metrics.increment_counter("sync_runs_total", &[]);

        match outcome {
            Ok(Ok(report)) => {
                if report.projects_failed > 0 {
                    metrics.increment_counter("sync_runs_failed_total", &[]);
                }
                metrics.increment_counter_by(
                    "issues_synced_total",
                    &[],
                    u64::from(report.issues_synced),
                );
                info!(
                    source,
                    processed = report.projects_processed,
                    failed = report.projects_failed,
                    issues = report.issues_synced,
                    duration_ms,
                    "sync run complete"
                );
                if let Some(id) = run_id {
                    if let Err(e) = self
                        .store
                        .complete_run(
                            id,
                            report.projects_processed,
                            report.projects_failed,
                            report.issues_synced,
                            &report.errors,
                            duration_ms,
                        )
                        .await
                    {
                        error!(error = %e, "failed to close sync-run record");
                    }
                }
            }
            Ok(Err(e)) => {
                metrics.increment_counter("sync_runs_failed_total", &[]);
                error!(source, error = %e, "sync run failed");
                if let Some(id) = run_id {
                    let mut errors = std::collections::BTreeMap::new();
                    errors.insert("run".to_string(), e.to_string());
                    let _ = self
                        .store
                        .complete_run(id, 0, 0, 0, &errors, duration_ms)
                        .await;
                }
            }
            Err(_elapsed) => {
                // Hard timeout: cancel in-flight work, record the partial
                // run, and discard any requested resync to avoid a runaway
                // loop.
                child.cancel();
                metrics.increment_counter("sync_runs_failed_total", &[]);
                warn!(
                    source,
                    timeout_s = self.run_timeout.as_secs(),
                    "sync run timed out"
                );
                if let Some(id) = run_id {
                    let mut errors = std::collections::BTreeMap::new();
                    errors.insert(
                        "run".to_string(),
                        format!("timed out after {}s", self.run_timeout.as_secs()),
                    );
                    let _ = self
                        .store
                        .complete_run(id, 0, 0, 0, &errors, duration_ms)
                        .await;
                }
                self.resync_requested.store(false, Ordering::SeqCst);
            }
        }

        if let Err(e) = self.store.prune_runs(RUN_HISTORY_KEEP).await {
            warn!(error = %e, "failed to prune sync-run history");
        }

        metrics.set_gauge("sync_in_progress", 0);
        self.in_progress.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
