//! Telemetry for the vibe-sync daemon: tracing setup and the process-wide
//! metrics collector exposed at `GET /metrics`.

pub mod logging;
pub mod metrics;

pub use metrics::{global_metrics, MetricsCollector};
