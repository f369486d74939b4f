//! In-process counter backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, trace};

use super::backend::{BackendResult, CounterBackend};
use super::counter::{window_delta, CounterState};
use crate::config::BackendConfig;
use crate::error::Result;

/// Expired windows are swept once every this many increments by default.
pub const DEFAULT_PURGE_EVERY: u64 = 1024;

/// Settings accepted by the `memory` backend kind.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySettings {
    /// Increments between two sweeps of expired windows; 0 disables sweeping
    #[serde(default = "default_purge_every")]
    pub purge_every: u64,
}

fn default_purge_every() -> u64 {
    DEFAULT_PURGE_EVERY
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            purge_every: default_purge_every(),
        }
    }
}

/// A counter backend that keeps all windows in process memory.
///
/// Each key lives in its own map shard entry, so concurrent increments of the
/// same key are serialized by the entry lock while unrelated keys proceed in
/// parallel. Expired windows are dropped by a sweep that runs every
/// `purge_every` increments.
#[derive(Debug)]
pub struct MemoryBackend {
    counters: DashMap<String, CounterState>,
    increments: AtomicU64,
    purge_every: u64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_purge_every(DEFAULT_PURGE_EVERY)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired windows every `purge_every` increments (0 never sweeps).
    pub fn with_purge_every(purge_every: u64) -> Self {
        Self {
            counters: DashMap::new(),
            increments: AtomicU64::new(0),
            purge_every,
        }
    }

    /// Build from a backend config, rejecting unknown settings.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let settings: MemorySettings = config.typed_settings()?;
        Ok(Self::with_purge_every(settings.purge_every))
    }

    fn purge_due(&self) -> bool {
        if self.purge_every == 0 {
            return false;
        }
        let done = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        done % self.purge_every == 0
    }

    /// Remove every expired window. Returns how many keys were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.counters.len();
        self.counters.retain(|_, state| !state.is_expired(now));
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired counters");
        }
        purged
    }

    /// Number of tracked keys, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    async fn increment(&self, key: &str, window: Duration) -> BackendResult<u64> {
        let window = window_delta(window)?;
        let now = Utc::now();

        let count = {
            let mut state = self
                .counters
                .entry(key.to_string())
                .or_try_insert_with(|| CounterState::start(now, window))?;
            state.increment(now, window)?
        };

        trace!(key = %key, count = count, "Incremented memory counter");

        // The entry guard is released above; sweeping locks every shard
        if self.purge_due() {
            self.purge_expired();
        }
        Ok(count)
    }

    async fn get_count(&self, key: &str) -> BackendResult<u64> {
        let now = Utc::now();
        Ok(self
            .counters
            .get(key)
            .map(|state| state.current_count(now))
            .unwrap_or(0))
    }

    async fn get_reset_time(&self, key: &str) -> BackendResult<Option<DateTime<Utc>>> {
        let now = Utc::now();
        Ok(self.counters.get(key).and_then(|state| state.reset_time(now)))
    }

    async fn reset(&self, key: &str) -> BackendResult<()> {
        self.counters.remove(key);
        Ok(())
    }

    async fn check_health(&self) -> bool {
        true
    }
}
