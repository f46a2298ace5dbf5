//! Control-plane HTTP surface: health, metrics, sync trigger, live config
//! updates, and the signed tracker webhook receiver.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::RwLock;
use tracing::{info, warn};

use vs_core::config::{ConfigHandle, ConfigPatch};
use vs_core::store::StateStore;
use vs_core::types::DivergenceReport;
use vs_sync::events::normalize_tracker_webhook;
use vs_sync::{SyncController, TriggerOutcome};

/// Shared state behind every handler.
pub struct ApiState {
    pub store: Arc<StateStore>,
    pub controller: Arc<SyncController>,
    pub config: ConfigHandle,
    pub started_at: Instant,
    pub reconcile_report: Arc<RwLock<Option<DivergenceReport>>>,
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/sync/trigger", post(post_sync_trigger))
        .route("/config", post(post_config))
        .route("/webhook/tracker", post(post_tracker_webhook))
        .route("/reconcile/report", get(get_reconcile_report))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health -- 200 while the engine is functional, 503 when the most
/// recent run failed outright.
async fn get_health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let projects_count = state.store.project_count().await.unwrap_or(0);
    let last_run = state
        .store
        .last_runs(1)
        .await
        .ok()
        .and_then(|runs| runs.into_iter().next());

    let last_sync_at = last_run.as_ref().and_then(|r| r.completed_at);
    // A run-level error (timeout, listing failure) marks the service
    // unhealthy; individual project errors do not.
    let last_failure = last_run
        .as_ref()
        .and_then(|r| r.errors.get("run").cloned());
    let healthy = last_failure.is_none();

    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "uptime_s": state.started_at.elapsed().as_secs(),
        "last_sync_at": last_sync_at.map(|t| t.to_rfc3339()),
        "sync_in_progress": state.controller.is_in_progress(),
        "projects_count": projects_count,
        "last_failure": last_failure,
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// GET /metrics -- Prometheus text exposition.
async fn get_metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let metrics = vs_telemetry::global_metrics();
    metrics.set_gauge(
        "projects_count",
        state.store.project_count().await.unwrap_or(0) as i64,
    );
    metrics.set_gauge("memory_rss_bytes", rss_bytes() as i64);

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.export_prometheus(),
    )
}

/// POST /sync/trigger -- 202 when a run is enqueued (or a resync scheduled),
/// 409 when denied by the debounce window.
async fn post_sync_trigger(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.controller.trigger_sync("api") {
        TriggerOutcome::Accepted => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "accepted"})),
        ),
        TriggerOutcome::AlreadyRunning => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "resync_scheduled"})),
        ),
        TriggerOutcome::Coalesced => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"status": "debounced"})),
        ),
    }
}

/// POST /config -- live-update the runtime-tunable options; returns the new
/// effective values.
async fn post_config(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<ConfigPatch>,
) -> impl IntoResponse {
    state.config.apply(&patch);
    let snap = state.config.current();
    info!(
        sync_interval_ms = snap.sync_interval_ms,
        max_workers = snap.max_workers,
        "configuration updated live"
    );
    Json(serde_json::json!({
        "sync_interval_ms": snap.sync_interval_ms,
        "max_workers": snap.max_workers,
        "sync_parallel": snap.sync_parallel,
        "skip_empty_projects": snap.skip_empty_projects,
        "incremental_sync": snap.incremental_sync,
        "dry_run": snap.dry_run,
    }))
}

/// POST /webhook/tracker -- HMAC-verified payload; 401 on a bad signature,
/// 200 with the number of affected projects on enqueue.
async fn post_tracker_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let secret = state.config.current().webhook_secret.clone();
    match &secret {
        Some(secret) => {
            let provided = headers
                .get("x-sync-signature")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !verify_signature(secret, &body, provided) {
                warn!("tracker webhook rejected: bad signature");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({"error": "bad signature"})),
                );
            }
        }
        None => {
            warn!("tracker webhook accepted without signature check (no secret configured)");
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "invalid JSON"})),
            )
        }
    };

    let projects = normalize_tracker_webhook(&payload);
    info!(projects = projects.len(), "tracker webhook received");
    state.controller.trigger_sync("webhook");
    (
        StatusCode::OK,
        Json(serde_json::json!({"enqueued": true, "projects": projects})),
    )
}

/// GET /reconcile/report -- the most recent divergence report, if any.
async fn get_reconcile_report(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.reconcile_report.read().await.clone() {
        Some(report) => Json(serde_json::json!(report)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no reconciliation has run yet"})),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Signature helpers
// ---------------------------------------------------------------------------

/// Verify `sha256=<hex>` over the raw body.
fn verify_signature(secret: &str, body: &[u8], provided: &str) -> bool {
    let Some(hex_sig) = provided.strip_prefix("sha256=") else {
        return false;
    };
    let Some(sig) = decode_hex(hex_sig) else {
        return false;
    };
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret.as_bytes());
    ring::hmac::verify(&key, body, &sig).is_ok()
}

/// Compute the signature header value for a body (used by tests and by
/// operators wiring up the tracker side).
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret.as_bytes());
    let tag = ring::hmac::sign(&key, body);
    let mut hex = String::with_capacity(tag.as_ref().len() * 2);
    for b in tag.as_ref() {
        hex.push_str(&format!("{:02x}", b));
    }
    format!("sha256={hex}")
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

fn rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = pages.parse::<u64>() {
                    return pages * 4096;
                }
            }
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
