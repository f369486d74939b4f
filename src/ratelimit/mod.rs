//! Rate limit counting across storage backends.

mod backend;
mod counter;
mod health;
mod memory;
mod multi;
mod registry;
mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendResult, CounterBackend};
pub use counter::{window_delta, CounterState, WindowError, MAX_WINDOW};
pub use health::{BackendStatus, HealthMonitor, HealthRecord, HealthState};
pub use memory::{MemoryBackend, MemorySettings};
pub use multi::{MultiBackend, MultiBackendStats};
pub use registry::{BackendFactory, BackendRegistry};
pub use strategy::{FailoverStrategy, StrategyKind};
