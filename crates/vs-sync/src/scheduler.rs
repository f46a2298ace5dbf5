//! Periodic timers: the full-sync interval (paused while a webhook
//! subscription is live) and the hourly three-way reconciliation. Both
//! re-read the live config snapshot every cycle, so `/config` updates take
//! effect without a restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vs_core::config::ConfigHandle;
use vs_core::types::DivergenceReport;

use crate::controller::SyncController;
use crate::orchestrator::SyncOrchestrator;

/// Interval of the exhaustive reconciliation pass.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(3600);

/// Poll granularity while the sync timer is disabled (`SYNC_INTERVAL=0`).
const DISABLED_POLL: Duration = Duration::from_secs(1);

pub struct Scheduler {
    config: ConfigHandle,
    controller: Arc<SyncController>,
    webhook_live: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        config: ConfigHandle,
        controller: Arc<SyncController>,
        webhook_live: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            controller,
            webhook_live,
        }
    }

    /// Periodic full-sync trigger. Reads the interval fresh each cycle and
    /// stays quiet while the webhook subscription is live.
    pub fn spawn_periodic(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval_ms = self.config.current().sync_interval_ms;
                let sleep_for = if interval_ms == 0 {
                    DISABLED_POLL
                } else {
                    Duration::from_millis(interval_ms)
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                if interval_ms == 0 {
                    continue;
                }
                if self.webhook_live.load(Ordering::SeqCst) {
                    debug!("webhook subscription live, periodic sync paused");
                    continue;
                }
                self.controller.trigger_sync("scheduler");
            }
            info!("periodic sync timer stopped");
        })
    }
}

/// Hourly exhaustive reconciliation. The latest report is kept in the shared
/// slot for the control API; projects with divergences get a sync trigger.
pub fn spawn_reconciliation(
    orchestrator: Arc<SyncOrchestrator>,
    controller: Arc<SyncController>,
    report_slot: Arc<RwLock<Option<DivergenceReport>>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            }

            match orchestrator.reconcile().await {
                Ok(report) => {
                    let diverged = !report.divergences.is_empty();
                    info!(
                        projects = report.projects_checked,
                        divergences = report.divergences.len(),
                        "reconciliation pass complete"
                    );
                    *report_slot.write().await = Some(report);
                    if diverged {
                        controller.trigger_sync("reconciliation");
                    }
                }
                Err(e) => warn!(error = %e, "reconciliation pass failed"),
            }
        }
        info!("reconciliation timer stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    use vs_core::config::{Config, ConfigPatch};
    use vs_core::store::StateStore;

    use crate::controller::{SyncRunner, TriggerOutcome};
    use crate::orchestrator::{RunReport, SyncError};

    struct CountingRunner(AtomicU32);

    #[async_trait]
    impl SyncRunner for CountingRunner {
        async fn run_sync(&self, _cancel: &CancellationToken) -> Result<RunReport, SyncError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(RunReport::default())
        }
    }

    async fn make_controller() -> (Arc<SyncController>, Arc<CountingRunner>) {
        let runner = Arc::new(CountingRunner(AtomicU32::new(0)));
        let store = Arc::new(StateStore::open_in_memory().await.unwrap());
        let ctl = SyncController::with_timing(
            Arc::clone(&runner) as Arc<dyn SyncRunner>,
            store,
            Duration::from_millis(5),
            Duration::from_secs(5),
        );
        (ctl, runner)
    }

    fn config_with_interval(ms: u64) -> ConfigHandle {
        ConfigHandle::new(Config {
            sync_interval_ms: ms,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn periodic_timer_triggers_syncs() {
        let (ctl, runner) = make_controller().await;
        let cancel = CancellationToken::new();
        ctl.spawn(cancel.clone());

        let scheduler = Scheduler::new(
            config_with_interval(30),
            Arc::clone(&ctl),
            Arc::new(AtomicBool::new(false)),
        );
        scheduler.spawn_periodic(cancel.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        assert!(runner.0.load(Ordering::SeqCst) >= 2, "expected repeated runs");
    }

    #[tokio::test]
    async fn webhook_live_pauses_periodic_sync() {
        let (ctl, runner) = make_controller().await;
        let cancel = CancellationToken::new();
        ctl.spawn(cancel.clone());

        let live = Arc::new(AtomicBool::new(true));
        let scheduler = Scheduler::new(config_with_interval(20), Arc::clone(&ctl), Arc::clone(&live));
        scheduler.spawn_periodic(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runner.0.load(Ordering::SeqCst), 0, "paused while live");

        // Subscription drops: polling resumes.
        live.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        assert!(runner.0.load(Ordering::SeqCst) >= 1, "resumed after drop");
    }

    #[tokio::test]
    async fn zero_interval_disables_timer() {
        let (ctl, runner) = make_controller().await;
        let cancel = CancellationToken::new();
        ctl.spawn(cancel.clone());

        let config = config_with_interval(0);
        let scheduler = Scheduler::new(
            config.clone(),
            Arc::clone(&ctl),
            Arc::new(AtomicBool::new(false)),
        );
        scheduler.spawn_periodic(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runner.0.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn live_config_update_changes_cadence() {
        let (ctl, runner) = make_controller().await;
        let cancel = CancellationToken::new();
        ctl.spawn(cancel.clone());

        // Start effectively disabled, then speed up live.
        let config = config_with_interval(0);
        let scheduler = Scheduler::new(
            config.clone(),
            Arc::clone(&ctl),
            Arc::new(AtomicBool::new(false)),
        );
        scheduler.spawn_periodic(cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runner.0.load(Ordering::SeqCst), 0);

        config.apply(&ConfigPatch {
            sync_interval_ms: Some(25),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        assert!(runner.0.load(Ordering::SeqCst) >= 1, "new interval took effect");
    }

    #[tokio::test]
    async fn manual_trigger_outcomes_are_stable() {
        // The scheduler relies on fire-and-forget semantics; double-check
        // the controller contract it depends on.
        let (ctl, _runner) = make_controller().await;
        let cancel = CancellationToken::new();
        ctl.spawn(cancel.clone());

        assert_eq!(ctl.trigger_sync("scheduler"), TriggerOutcome::Accepted);
        assert_eq!(ctl.trigger_sync("scheduler"), TriggerOutcome::Coalesced);
        cancel.cancel();
    }
}
