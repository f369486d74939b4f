//! Error types for the Hivecount service.

use std::fmt;

use thiserror::Error;

use crate::mesh::ClusterError;

/// Failure reported by a single counter backend.
///
/// Both variants are a failover signal for the orchestrator; they are kept
/// apart so diagnostics can tell a flaky store from a broken one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transient failure: timeout, connection refused, store down.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Unexpected fault inside the backend.
    #[error("backend internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether this is a transient failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// A backend failure tagged with the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    /// Configured backend name
    pub backend: String,
    /// What went wrong
    pub error: BackendError,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.error)
    }
}

/// Main error type for Hivecount operations.
#[derive(Error, Debug)]
pub enum HivecountError {
    /// Invalid or contradictory configuration. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The caller passed an argument no backend could accept. No backend
    /// was contacted and no health record changed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Every candidate backend failed for one operation.
    #[error("All backends failed for {operation}: [{}]", join_failures(.failures))]
    AllBackendsFailed {
        /// The operation that was attempted
        operation: &'static str,
        /// Per-backend failures, in attempt order
        failures: Vec<BackendFailure>,
    },

    /// Cluster membership errors from the mesh backend
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for Hivecount operations.
pub type Result<T> = std::result::Result<T, HivecountError>;
