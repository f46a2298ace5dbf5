//! The sync core: per-project reconciliation across tracker, board, and
//! local store, conflict resolution, the global sync controller, event
//! ingress, and the periodic scheduler.

pub mod conflict;
pub mod controller;
pub mod events;
pub mod orchestrator;
pub mod scheduler;

pub use controller::{SyncController, TriggerOutcome};
pub use orchestrator::{RunReport, SyncError, SyncOrchestrator};
