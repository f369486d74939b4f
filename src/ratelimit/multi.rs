//! Multi-backend orchestrator.
//!
//! Holds the configured backends, keeps their health records current through
//! the [`HealthMonitor`], and runs every counter operation against the
//! candidates chosen by the [`FailoverStrategy`] until one succeeds.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::backend::{BackendResult, CounterBackend};
use super::counter::window_delta;
use super::health::{BackendStatus, HealthMonitor};
use super::registry::BackendRegistry;
use super::strategy::{FailoverStrategy, StrategyKind};
use crate::config::HivecountConfig;
use crate::error::{BackendError, BackendFailure, HivecountError, Result};

/// A configured backend and the instance serving it.
struct BackendHandle {
    name: String,
    backend: Arc<dyn CounterBackend>,
}

/// Aggregate view over all backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiBackendStats {
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub fallback_strategy: String,
}

/// Counter store spread over several named backends with failover.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct MultiBackend {
    handles: Vec<BackendHandle>,
    monitor: HealthMonitor,
    strategy: FailoverStrategy,
    operation_timeout: Duration,
}

impl std::fmt::Debug for MultiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBackend")
            .field("backends", &self.backend_names())
            .field("strategy", &self.strategy.kind())
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl MultiBackend {
    /// Build every configured backend through the registry.
    ///
    /// The configuration is validated and every backend kind resolved before
    /// any backend is constructed; on error nothing is kept.
    pub async fn from_config(config: &HivecountConfig, registry: &BackendRegistry) -> Result<Self> {
        config.validate()?;

        if let Some(unknown) = config
            .backends
            .iter()
            .find(|backend| !registry.contains(&backend.kind))
        {
            return Err(HivecountError::Configuration(format!(
                "backend '{}' has unknown kind '{}' (known: {})",
                unknown.name,
                unknown.kind,
                registry.kinds().join(", ")
            )));
        }

        let mut handles = Vec::with_capacity(config.backends.len());
        for backend_config in &config.backends {
            let backend = registry.build(backend_config).await?;
            handles.push(BackendHandle {
                name: backend_config.name.clone(),
                backend,
            });
        }

        let monitor = HealthMonitor::new(
            handles.iter().map(|handle| handle.name.clone()).collect(),
            config.health_check_interval(),
            config.health_check_timeout(),
            config.failure_threshold,
        );

        info!(
            backends = ?handles.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
            strategy = %config.strategy,
            health_check_interval_secs = config.health_check_interval_secs,
            "Multi-backend counter initialized"
        );

        Ok(Self {
            handles,
            monitor,
            strategy: FailoverStrategy::new(config.strategy),
            operation_timeout: config.operation_timeout(),
        })
    }

    /// Configured backend names, in configured order.
    pub fn backend_names(&self) -> Vec<&str> {
        self.handles.iter().map(|handle| handle.name.as_str()).collect()
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Increment `key` within a window of `window`. Returns the new count.
    ///
    /// A zero or oversized window is rejected before any backend is
    /// contacted, so it never counts against backend health.
    pub async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        if let Err(err) = window_delta(window) {
            debug!(key = %key, error = %err, "Rejected increment window");
            return Err(HivecountError::InvalidArgument(err.to_string()));
        }

        self.execute("increment", |backend| async move {
            backend.increment(key, window).await
        })
        .await
    }

    /// Current count for `key`.
    pub async fn get_count(&self, key: &str) -> Result<u64> {
        self.execute("get_count", |backend| async move { backend.get_count(key).await })
            .await
    }

    /// When the current window of `key` expires.
    pub async fn get_reset_time(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.execute("get_reset_time", |backend| async move {
            backend.get_reset_time(key).await
        })
        .await
    }

    /// Drop the state of `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.execute("reset", |backend| async move { backend.reset(key).await })
            .await
    }

    /// Health of every backend by name. Does not trigger health checks; see
    /// [`MultiBackend::refresh_health`].
    pub fn get_backend_status(&self) -> BTreeMap<String, BackendStatus> {
        self.handles
            .iter()
            .zip(self.monitor.snapshot())
            .map(|(handle, state)| (handle.name.clone(), BackendStatus::from(&state)))
            .collect()
    }

    /// Aggregate counts derived from the current health records.
    pub fn get_stats(&self) -> MultiBackendStats {
        let healthy_backends = self
            .monitor
            .health_flags()
            .into_iter()
            .filter(|healthy| *healthy)
            .count();

        MultiBackendStats {
            total_backends: self.handles.len(),
            healthy_backends,
            fallback_strategy: self.strategy.kind().to_string(),
        }
    }

    /// Run the health check of every backend whose information is stale.
    ///
    /// Counter operations do this on their own. Call it before reading
    /// [`MultiBackend::get_backend_status`] or [`MultiBackend::get_stats`]
    /// when no operation has run recently.
    pub async fn refresh_health(&self) {
        let backends: Vec<&dyn CounterBackend> = self
            .handles
            .iter()
            .map(|handle| handle.backend.as_ref())
            .collect();
        self.monitor.refresh(&backends).await;
    }

    /// Run one operation against the candidate backends in order.
    ///
    /// Each attempt is bounded by the operation timeout. The first success is
    /// returned; if every candidate fails, all failures are returned together.
    async fn execute<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn CounterBackend>) -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        self.refresh_health().await;
        let candidates = self.strategy.candidates(&self.monitor.health_flags());

        trace!(
            operation = operation,
            candidates = ?candidates,
            "Selected candidate backends"
        );

        let mut failures = Vec::new();

        for index in candidates {
            let handle = &self.handles[index];

            let outcome =
                match tokio::time::timeout(self.operation_timeout, call(handle.backend.clone()))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BackendError::Unavailable(format!(
                        "{} timed out after {}ms",
                        operation,
                        self.operation_timeout.as_millis()
                    ))),
                };

            match outcome {
                Ok(value) => {
                    self.monitor.record_success(index);
                    if !failures.is_empty() {
                        debug!(
                            operation = operation,
                            backend = %handle.name,
                            failed_attempts = failures.len(),
                            "Operation succeeded after failover"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    match &err {
                        BackendError::Unavailable(_) => warn!(
                            operation = operation,
                            backend = %handle.name,
                            error = %err,
                            "Backend unavailable, trying next candidate"
                        ),
                        BackendError::Internal(_) => error!(
                            operation = operation,
                            backend = %handle.name,
                            error = %err,
                            "Backend internal error, trying next candidate"
                        ),
                    }
                    self.monitor.record_failure(index, &err);
                    failures.push(BackendFailure {
                        backend: handle.name.clone(),
                        error: err,
                    });
                }
            }
        }

        error!(
            operation = operation,
            attempts = failures.len(),
            "All backends failed"
        );
        Err(HivecountError::AllBackendsFailed {
            operation,
            failures,
        })
    }
}

fn into_backend_error(err: HivecountError) -> BackendError {
    match err {
        HivecountError::AllBackendsFailed { .. } => BackendError::Unavailable(err.to_string()),
        other => BackendError::Internal(other.to_string()),
    }
}

#[async_trait]
impl CounterBackend for MultiBackend {
    async fn increment(&self, key: &str, window: Duration) -> BackendResult<u64> {
        self.increment(key, window).await.map_err(into_backend_error)
    }

    async fn get_count(&self, key: &str) -> BackendResult<u64> {
        self.get_count(key).await.map_err(into_backend_error)
    }

    async fn get_reset_time(&self, key: &str) -> BackendResult<Option<DateTime<Utc>>> {
        self.get_reset_time(key).await.map_err(into_backend_error)
    }

    async fn reset(&self, key: &str) -> BackendResult<()> {
        self.reset(key).await.map_err(into_backend_error)
    }

    async fn check_health(&self) -> bool {
        self.refresh_health().await;
        self.monitor.health_flags().into_iter().any(|healthy| healthy)
    }
}
