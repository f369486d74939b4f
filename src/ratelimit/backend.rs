//! Counter backend trait for abstracting over storage implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BackendError;

/// Result type returned by backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Trait for counter storage backends.
///
/// This trait abstracts over the in-memory store, the gossip mesh and any
/// store registered by the hosting application, so the orchestrator can
/// fail over between them.
///
/// Implementations must make `increment` atomic per key and must bound
/// `check_health` with their own timeout.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Increment the counter for `key` within a window of `window`, creating
    /// it with a count of 1 if absent. Returns the new count.
    async fn increment(&self, key: &str, window: Duration) -> BackendResult<u64>;

    /// Current count for `key`; 0 if absent or expired.
    async fn get_count(&self, key: &str) -> BackendResult<u64>;

    /// When the current window of `key` expires.
    async fn get_reset_time(&self, key: &str) -> BackendResult<Option<DateTime<Utc>>>;

    /// Drop all state for `key`.
    async fn reset(&self, key: &str) -> BackendResult<()>;

    /// Lightweight liveness check.
    async fn check_health(&self) -> bool;
}
