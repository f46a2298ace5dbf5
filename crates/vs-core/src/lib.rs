//! Core types and infrastructure for the vibe-sync engine: configuration,
//! canonical entities, the embedded state store, the status mapper, content
//! hashing, file watching, and per-project locking.

pub mod config;
pub mod hash;
pub mod mutexes;
pub mod status;
pub mod store;
pub mod types;
pub mod watcher;

pub use config::{Config, ConfigError, ConfigHandle};
pub use store::{StateStore, StoreError};
