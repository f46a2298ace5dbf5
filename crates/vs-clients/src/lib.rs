//! Typed clients for the three external issue sources and the agent
//! platform, all sharing one connection-pooled HTTP client with retry,
//! timeout, and slow-call instrumentation.

pub mod board;
pub mod http;
pub mod localstore;
pub mod platform;
pub mod tracker;

pub use http::{HttpError, HttpPool};
