//! Per-backend health tracking.
//!
//! Health is checked lazily: a backend is checked only when it is about to be
//! considered for an operation and its last check is older than the
//! configured interval. Failed operations feed back into the same records
//! immediately, without waiting for the next check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::CounterBackend;
use crate::error::BackendError;

/// Mutable liveness state of one backend.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub healthy: bool,
    /// Monotonic time of the last completed check, for scheduling
    pub last_checked_at: Option<Instant>,
    /// Wall clock time of the last completed check, for reporting
    pub last_checked_wall: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<BackendError>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: true,
            last_checked_at: None,
            last_checked_wall: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Point-in-time view of a backend's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl From<&HealthState> for BackendStatus {
    fn from(state: &HealthState) -> Self {
        Self {
            healthy: state.healthy,
            last_checked_at: state.last_checked_wall,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Health record for one backend.
///
/// Each record has its own lock; there is no lock spanning backends.
#[derive(Debug, Default)]
pub struct HealthRecord {
    state: Mutex<HealthState>,
    checking: AtomicBool,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> HealthState {
        self.state.lock().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    fn is_due(&self, now: Instant, interval: Duration) -> bool {
        match self.state.lock().last_checked_at {
            Some(checked) => now.saturating_duration_since(checked) >= interval,
            None => true,
        }
    }

    /// Claim the right to check. Returns `None` if a check is already running.
    fn try_begin_check(&self) -> Option<CheckGuard<'_>> {
        self.checking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CheckGuard { record: self })
    }
}

/// Releases the check claim when dropped, including on cancellation.
struct CheckGuard<'a> {
    record: &'a HealthRecord,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.record.checking.store(false, Ordering::Release);
    }
}

/// Outcome of applying an event to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Unchanged,
    Recovered,
    Failed,
}

/// Owns the health records of all configured backends and drives their
/// state machine.
///
/// Records are indexed in configured backend order.
#[derive(Debug)]
pub struct HealthMonitor {
    names: Vec<String>,
    records: Vec<HealthRecord>,
    interval: Duration,
    check_timeout: Duration,
    failure_threshold: u32,
}

impl HealthMonitor {
    /// Create a monitor with one fresh record per backend name.
    pub fn new(
        names: Vec<String>,
        interval: Duration,
        check_timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        let records = names.iter().map(|_| HealthRecord::new()).collect();
        Self {
            names,
            records,
            interval,
            check_timeout,
            failure_threshold: failure_threshold.max(1),
        }
    }

    #[cfg(test)]
    fn record(&self, index: usize) -> Option<&HealthRecord> {
        self.records.get(index)
    }

    /// Healthy flag of every backend, in configured order.
    pub fn health_flags(&self) -> Vec<bool> {
        self.records.iter().map(HealthRecord::is_healthy).collect()
    }

    /// Current state of every backend, in configured order.
    pub fn snapshot(&self) -> Vec<HealthState> {
        self.records.iter().map(HealthRecord::snapshot).collect()
    }

    /// Check every backend whose last check is older than the interval.
    ///
    /// `backends` must be in the same order as the monitor's records. Checks
    /// run concurrently; a backend already being checked by another caller is
    /// skipped and its cached state used.
    pub async fn refresh(&self, backends: &[&dyn CounterBackend]) {
        let now = Instant::now();
        let checks = self
            .records
            .iter()
            .zip(backends.iter())
            .enumerate()
            .filter(|(_, (record, _))| record.is_due(now, self.interval))
            .filter_map(|(index, (record, backend))| {
                record
                    .try_begin_check()
                    .map(|guard| self.run_check(index, *backend, guard))
            });

        join_all(checks).await;
    }

    async fn run_check(&self, index: usize, backend: &dyn CounterBackend, _guard: CheckGuard<'_>) {
        let outcome = match tokio::time::timeout(self.check_timeout, backend.check_health()).await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(BackendError::Unavailable("health check failed".to_string())),
            Err(_) => {
                debug!(backend = %self.names[index], "Health check timed out");
                Err(BackendError::Unavailable(format!(
                    "health check timed out after {}ms",
                    self.check_timeout.as_millis()
                )))
            }
        };
        let healthy = outcome.is_ok();

        let transition = {
            let mut state = self.records[index].state.lock();
            state.last_checked_at = Some(Instant::now());
            state.last_checked_wall = Some(Utc::now());
            match outcome {
                Ok(()) => Self::apply_success(&mut state),
                Err(error) => Self::apply_failure(&mut state, error, self.failure_threshold),
            }
        };

        debug!(
            backend = %self.names[index],
            healthy = healthy,
            "Health check completed"
        );
        self.log_transition(index, transition);
    }

    /// Record a successful operation against a backend.
    pub fn record_success(&self, index: usize) {
        let Some(record) = self.records.get(index) else {
            return;
        };
        let transition = Self::apply_success(&mut record.state.lock());
        self.log_transition(index, transition);
    }

    /// Record a failed operation against a backend.
    pub fn record_failure(&self, index: usize, error: &BackendError) {
        let Some(record) = self.records.get(index) else {
            return;
        };
        let transition =
            Self::apply_failure(&mut record.state.lock(), error.clone(), self.failure_threshold);
        self.log_transition(index, transition);
    }

    fn apply_success(state: &mut HealthState) -> Transition {
        let was_healthy = state.healthy;
        state.healthy = true;
        state.consecutive_failures = 0;
        state.last_error = None;
        if was_healthy {
            Transition::Unchanged
        } else {
            Transition::Recovered
        }
    }

    fn apply_failure(state: &mut HealthState, error: BackendError, threshold: u32) -> Transition {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error);
        if state.healthy && state.consecutive_failures >= threshold {
            state.healthy = false;
            Transition::Failed
        } else {
            Transition::Unchanged
        }
    }

    fn log_transition(&self, index: usize, transition: Transition) {
        match transition {
            Transition::Unchanged => {}
            Transition::Recovered => {
                info!(backend = %self.names[index], "Backend recovered");
            }
            Transition::Failed => {
                warn!(
                    backend = %self.names[index],
                    threshold = self.failure_threshold,
                    "Backend marked unhealthy"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::testing::ControlledBackend;

    fn monitor(count: usize, interval: Duration, threshold: u32) -> HealthMonitor {
        let names = (0..count).map(|i| format!("backend{}", i)).collect();
        HealthMonitor::new(names, interval, Duration::from_millis(50), threshold)
    }

    #[test]
    fn test_records_start_healthy_and_unchecked() {
        let monitor = monitor(2, Duration::from_secs(30), 1);
        for state in monitor.snapshot() {
            assert!(state.healthy);
            assert!(state.last_checked_at.is_none());
            assert_eq!(state.consecutive_failures, 0);
        }
    }

    #[test]
    fn test_failure_threshold() {
        let monitor = monitor(1, Duration::from_secs(30), 3);
        let error = BackendError::Unavailable("down".to_string());

        monitor.record_failure(0, &error);
        monitor.record_failure(0, &error);
        assert!(monitor.health_flags()[0]);

        monitor.record_failure(0, &error);
        let state = monitor.record(0).unwrap().snapshot();
        assert!(!state.healthy);
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.last_error, Some(error));
    }

    #[test]
    fn test_single_success_recovers() {
        let monitor = monitor(1, Duration::from_secs(30), 1);
        monitor.record_failure(0, &BackendError::Internal("boom".to_string()));
        assert!(!monitor.health_flags()[0]);

        monitor.record_success(0);
        let state = monitor.record(0).unwrap().snapshot();
        assert!(state.healthy);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_operational_failure_does_not_touch_schedule() {
        let monitor = monitor(1, Duration::from_secs(30), 1);
        monitor.record_failure(0, &BackendError::Unavailable("down".to_string()));
        assert!(monitor.record(0).unwrap().snapshot().last_checked_at.is_none());
    }

    #[tokio::test]
    async fn test_refresh_marks_failed_check_unhealthy() {
        let monitor = monitor(2, Duration::from_secs(30), 1);
        let up = ControlledBackend::new();
        let down = ControlledBackend::new();
        down.set_healthy(false);

        monitor.refresh(&[&up, &down]).await;

        let states = monitor.snapshot();
        assert!(states[0].healthy);
        assert!(states[0].last_checked_wall.is_some());
        assert!(!states[1].healthy);
        assert_eq!(states[1].consecutive_failures, 1);
        assert_eq!(
            states[1].last_error,
            Some(BackendError::Unavailable("health check failed".to_string()))
        );
        assert_eq!(up.health_checks(), 1);
        assert_eq!(down.health_checks(), 1);
    }

    #[tokio::test]
    async fn test_refresh_is_time_gated() {
        let monitor = monitor(1, Duration::from_secs(30), 1);
        let backend = ControlledBackend::new();

        monitor.refresh(&[&backend]).await;
        monitor.refresh(&[&backend]).await;
        monitor.refresh(&[&backend]).await;

        assert_eq!(backend.health_checks(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_checks_every_time() {
        let monitor = monitor(1, Duration::ZERO, 1);
        let backend = ControlledBackend::new();

        monitor.refresh(&[&backend]).await;
        monitor.refresh(&[&backend]).await;

        assert_eq!(backend.health_checks(), 2);
    }

    #[tokio::test]
    async fn test_successful_check_recovers_backend() {
        let monitor = monitor(1, Duration::ZERO, 1);
        let backend = ControlledBackend::new();
        backend.set_healthy(false);

        monitor.refresh(&[&backend]).await;
        assert!(!monitor.health_flags()[0]);

        backend.set_healthy(true);
        monitor.refresh(&[&backend]).await;
        assert!(monitor.health_flags()[0]);
    }

    #[tokio::test]
    async fn test_hung_health_check_times_out_as_failure() {
        let monitor = monitor(1, Duration::from_secs(30), 1);
        let backend = ControlledBackend::new();
        backend.set_hanging(true);

        let started = Instant::now();
        monitor.refresh(&[&backend]).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!monitor.health_flags()[0]);

        let state = monitor.record(0).unwrap().snapshot();
        assert_eq!(
            state.last_error,
            Some(BackendError::Unavailable(
                "health check timed out after 50ms".to_string()
            ))
        );
        assert_eq!(
            BackendStatus::from(&state).last_error.as_deref(),
            Some("backend unavailable: health check timed out after 50ms")
        );
    }

    #[tokio::test]
    async fn test_cancelled_check_releases_claim() {
        let monitor = monitor(1, Duration::ZERO, 1);
        let backend = ControlledBackend::new();
        backend.set_hanging(true);

        // Abandon the refresh while the check is in flight
        let _ = tokio::time::timeout(Duration::from_millis(5), monitor.refresh(&[&backend])).await;
        assert!(!monitor.records[0].checking.load(Ordering::Acquire));

        backend.set_hanging(false);
        monitor.refresh(&[&backend]).await;
        assert_eq!(backend.health_checks(), 2);
    }

    #[test]
    fn test_status_from_state() {
        let mut state = HealthState::default();
        state.healthy = false;
        state.consecutive_failures = 2;
        state.last_error = Some(BackendError::Unavailable("timed out".to_string()));

        let status = BackendStatus::from(&state);
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("backend unavailable: timed out"));
    }
}
