//! Backend with injectable faults for exercising failover in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::backend::{BackendResult, CounterBackend};
use super::memory::MemoryBackend;
use crate::error::BackendError;

/// A memory backend whose availability, health and latency can be toggled.
#[derive(Debug)]
pub struct ControlledBackend {
    inner: MemoryBackend,
    available: AtomicBool,
    internal_fault: AtomicBool,
    healthy: AtomicBool,
    hanging: AtomicBool,
    health_checks: AtomicUsize,
    operations: AtomicUsize,
}

impl Default for ControlledBackend {
    fn default() -> Self {
        Self {
            inner: MemoryBackend::new(),
            available: AtomicBool::new(true),
            internal_fault: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            hanging: AtomicBool::new(false),
            health_checks: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
        }
    }
}

impl ControlledBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make counter operations fail with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make counter operations fail with `Internal`.
    pub fn set_internal_fault(&self, fault: bool) {
        self.internal_fault.store(fault, Ordering::SeqCst);
    }

    /// Control the health check answer.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make every call, health checks included, never complete.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Simulate a full outage: health checks and operations fail.
    pub fn set_down(&self) {
        self.set_available(false);
        self.set_healthy(false);
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> BackendResult<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.internal_fault.load(Ordering::SeqCst) {
            return Err(BackendError::Internal("injected fault".to_string()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterBackend for ControlledBackend {
    async fn increment(&self, key: &str, window: Duration) -> BackendResult<u64> {
        self.gate().await?;
        self.inner.increment(key, window).await
    }

    async fn get_count(&self, key: &str) -> BackendResult<u64> {
        self.gate().await?;
        self.inner.get_count(key).await
    }

    async fn get_reset_time(&self, key: &str) -> BackendResult<Option<DateTime<Utc>>> {
        self.gate().await?;
        self.inner.get_reset_time(key).await
    }

    async fn reset(&self, key: &str) -> BackendResult<()> {
        self.gate().await?;
        self.inner.reset(key).await
    }

    async fn check_health(&self) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.healthy.load(Ordering::SeqCst)
    }
}
