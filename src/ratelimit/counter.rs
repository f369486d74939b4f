//! Fixed window counter state.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::error::BackendError;

/// Longest window a counter accepts (one leap year).
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// A window length no counter can hold.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    #[error("window must be non-zero")]
    Zero,
    #[error("window of {}s exceeds the maximum of {}s", .0.as_secs(), MAX_WINDOW.as_secs())]
    TooLong(Duration),
}

impl From<WindowError> for BackendError {
    fn from(err: WindowError) -> Self {
        BackendError::Internal(err.to_string())
    }
}

/// Convert a window length to a chrono delta, rejecting zero and anything
/// longer than [`MAX_WINDOW`].
pub fn window_delta(window: Duration) -> Result<TimeDelta, WindowError> {
    if window.is_zero() {
        return Err(WindowError::Zero);
    }
    if window > MAX_WINDOW {
        return Err(WindowError::TooLong(window));
    }
    TimeDelta::from_std(window).map_err(|_| WindowError::TooLong(window))
}

/// The count accumulated for one key within one fixed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterState {
    /// Hits recorded in this window
    pub count: u64,
    /// When the window started
    pub window_start: DateTime<Utc>,
    /// When the window ends
    pub expires_at: DateTime<Utc>,
}

impl CounterState {
    /// Start an empty window at `now`.
    pub fn start(now: DateTime<Utc>, window: TimeDelta) -> Result<Self, BackendError> {
        let expires_at = now.checked_add_signed(window).ok_or_else(|| {
            BackendError::Internal(format!("window end out of range: {} + {}", now, window))
        })?;
        Ok(Self {
            count: 0,
            window_start: now,
            expires_at,
        })
    }

    /// Whether the window is over at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Add one hit, restarting the window first if it has expired.
    ///
    /// Returns the new count.
    pub fn increment(
        &mut self,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<u64, BackendError> {
        if self.is_expired(now) {
            *self = Self::start(now, window)?;
        }
        self.count = self.count.saturating_add(1);
        Ok(self.count)
    }

    /// The count visible at `now`.
    pub fn current_count(&self, now: DateTime<Utc>) -> u64 {
        if self.is_expired(now) {
            0
        } else {
            self.count
        }
    }

    /// The reset time visible at `now`.
    pub fn reset_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_expired(now) {
            None
        } else {
            Some(self.expires_at)
        }
    }
}
