//! vibe-sync daemon: wires the state store, the four external clients, the
//! agent lifecycle manager, the sync controller, the event ingress loops,
//! and the control API into one process, then runs until ctrl-c.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vs_agents::{AgentLifecycleManager, LifecycleConfig};
use vs_clients::board::BoardClient;
use vs_clients::localstore::LocalStoreAdapter;
use vs_clients::platform::PlatformClient;
use vs_clients::tracker::TrackerClient;
use vs_clients::HttpPool;
use vs_core::config::{Config, ConfigHandle};
use vs_core::mutexes::ProjectMutexes;
use vs_core::store::StateStore;
use vs_core::watcher::{ProjectWatcher, WatchConfig};
use vs_sync::scheduler::{spawn_reconciliation, Scheduler};
use vs_sync::{events, SyncController, SyncOrchestrator};

mod api;

/// Tag carried by every platform agent this deployment manages.
const SERVICE_TAG: &str = "vibe-sync";

const STATE_DB_PATH: &str = "logs/sync-state.db";

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        vs_telemetry::logging::init_logging_json("vs-daemon", "info");
    } else {
        vs_telemetry::logging::init_logging("vs-daemon", "info");
    }

    let config = Config::from_env().context("failed to read configuration")?;
    // Mis-configured mandatory URLs are fatal.
    config.validate().context("invalid configuration")?;
    info!(
        tracker = %config.tracker_api_url,
        board = %config.board_api_url,
        sync_interval_ms = config.sync_interval_ms,
        dry_run = config.dry_run,
        "vibe-sync daemon starting"
    );

    std::fs::create_dir_all("logs").context("failed to create logs directory")?;
    let store = Arc::new(
        StateStore::open(STATE_DB_PATH)
            .await
            .context("failed to open state store")?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                cancel.cancel();
            }
        });
    }

    // -- Clients --------------------------------------------------------------
    // The legacy non-REST transports were retired; the flags survive so old
    // deployments keep starting, but REST is the only path.
    if !config.tracker_use_rest {
        warn!("TRACKER_USE_REST=false requested but only the REST client is available");
    }
    if !config.board_use_rest {
        warn!("BOARD_USE_REST=false requested but only the REST client is available");
    }

    let pool = Arc::new(HttpPool::new(cancel.clone(), config.api_delay_ms));
    let tracker = Arc::new(TrackerClient::new(Arc::clone(&pool), &config.tracker_api_url));
    let board = Arc::new(BoardClient::new(Arc::clone(&pool), &config.board_api_url));
    let mutexes = ProjectMutexes::new();
    let local = Arc::new(LocalStoreAdapter::new());

    if let Err(e) = board.ensure_reachable().await {
        warn!(error = %e, "board not reachable at startup, continuing");
    }

    let lifecycle = build_lifecycle(&config, &pool, &store).await;

    // -- Sync core ------------------------------------------------------------
    let config_handle = ConfigHandle::new(config.clone());
    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&tracker),
        Arc::clone(&board),
        Arc::clone(&local),
        lifecycle.clone(),
        config_handle.clone(),
        mutexes.clone(),
    ));
    let controller = SyncController::new(
        Arc::clone(&orchestrator) as Arc<dyn vs_sync::controller::SyncRunner>,
        Arc::clone(&store),
    );
    controller.spawn(cancel.clone());

    // -- Event ingress --------------------------------------------------------
    events::spawn_board_sse(Arc::clone(&board), Arc::clone(&controller), cancel.clone());

    let webhook_live = Arc::new(AtomicBool::new(false));
    events::spawn_tracker_longpoll(
        Arc::clone(&tracker),
        Arc::clone(&controller),
        Arc::clone(&webhook_live),
        cancel.clone(),
    );

    spawn_watchers(
        &store,
        &controller,
        lifecycle.as_ref(),
        cancel.clone(),
    )
    .await;

    // -- Timers ---------------------------------------------------------------
    Scheduler::new(
        config_handle.clone(),
        Arc::clone(&controller),
        Arc::clone(&webhook_live),
    )
    .spawn_periodic(cancel.clone());

    let reconcile_report = Arc::new(RwLock::new(None));
    spawn_reconciliation(
        Arc::clone(&orchestrator),
        Arc::clone(&controller),
        Arc::clone(&reconcile_report),
        cancel.clone(),
    );

    // Kick off the first sync immediately rather than waiting a full
    // interval.
    controller.trigger_sync("startup");

    // -- API server -----------------------------------------------------------
    let state = Arc::new(api::ApiState {
        store: Arc::clone(&store),
        controller: Arc::clone(&controller),
        config: config_handle.clone(),
        started_at: Instant::now(),
        reconcile_report,
    });
    let app = api::api_router(state);

    let bind = format!("0.0.0.0:{}", config.health_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind API listener on {bind}"))?;
    info!(addr = %bind, "API server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server failed")?;

    // Give the controller loop a moment to observe cancellation and drain.
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("vibe-sync daemon stopped");
    Ok(())
}

/// Build the agent lifecycle manager when the platform integration is
/// configured, running the query-parameter self-check first. A failing
/// self-check disables the integration rather than running against a
/// platform that drops filters.
async fn build_lifecycle(
    config: &Config,
    pool: &Arc<HttpPool>,
    store: &Arc<StateStore>,
) -> Option<Arc<AgentLifecycleManager>> {
    let base_url = config.agent.base_url.clone()?;

    let platform = Arc::new(PlatformClient::new(
        Arc::clone(pool),
        base_url,
        config.agent.api_key.clone(),
    ));

    if let Err(e) = platform.verify_query_params(SERVICE_TAG).await {
        error!(error = %e, "agent platform failed the query-parameter self-check; \
               agent integration disabled for this run");
        return None;
    }

    let lifecycle_config = LifecycleConfig {
        name_prefix: "Sync".to_string(),
        service_tag: SERVICE_TAG.to_string(),
        control_name: config.agent.control_name.clone(),
        sync_tools_from_control: config.agent.sync_tools_from_control,
        sync_tools_force: config.agent.sync_tools_force,
        attach_repo_docs: config.agent.attach_repo_docs,
        model: config.agent.model.clone(),
        embedding: config.agent.embedding.clone(),
        dry_run: config.dry_run,
        control_tools_ttl: Duration::from_millis(config.sync_interval_ms.max(1000)),
    };
    Some(Arc::new(AgentLifecycleManager::new(
        platform,
        Arc::clone(store),
        lifecycle_config,
    )))
}

/// Register filesystem watchers for every project with a known local path:
/// one watcher feeding sync triggers for local-store changes, one feeding
/// the documentation upload flow.
async fn spawn_watchers(
    store: &Arc<StateStore>,
    controller: &Arc<SyncController>,
    lifecycle: Option<&Arc<AgentLifecycleManager>>,
    cancel: CancellationToken,
) {
    let projects = match store.list_projects().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "could not list projects for watchers");
            return;
        }
    };

    let mut store_watcher = match ProjectWatcher::new(WatchConfig::default()) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "local-store watcher unavailable");
            return;
        }
    };
    let mut docs_watcher = ProjectWatcher::new(WatchConfig::default()).ok();

    let mut watched = 0;
    for project in &projects {
        let Some(path) = &project.filesystem_path else {
            continue;
        };
        let root = Path::new(path);
        if !root.is_dir() {
            continue;
        }
        if let Err(e) = store_watcher.watch_project(&project.identifier, root) {
            warn!(project = %project.identifier, error = %e, "watch failed");
            continue;
        }
        if let Some(w) = docs_watcher.as_mut() {
            let _ = w.watch_project(&project.identifier, root);
        }
        watched += 1;
    }
    info!(watched, "filesystem watchers registered");

    events::spawn_localstore_watcher(store_watcher, Arc::clone(controller), cancel.clone());
    if let (Some(watcher), Some(lifecycle)) = (docs_watcher, lifecycle) {
        events::spawn_docs_watcher(
            watcher,
            Arc::clone(lifecycle),
            Arc::clone(store),
            cancel,
        );
    }
}
