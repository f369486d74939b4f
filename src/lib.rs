//! Hivecount - Rate Limit Counting Across Storage Backends
//!
//! This crate keeps rate limit counters in one of several interchangeable
//! storage backends (in-process memory, a gossip mesh, or any store the
//! hosting application registers). A multi-backend orchestrator tracks the
//! health of every backend and fails over between them, so counting stays
//! available while individual backends come and go.

pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;

pub use config::{BackendConfig, HivecountConfig};
pub use error::{BackendError, BackendFailure, HivecountError, Result};
pub use ratelimit::{BackendRegistry, CounterBackend, MultiBackend, StrategyKind};
