//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of fixed window counters.
//!
//! Every node publishes only its own contribution to a counter:
//!
//! - `counter|{key}` = `{window_start_ms}:{expires_at_ms}:{count}`
//! - `reset|{key}` = `{reset_at_ms}`
//!
//! Readers combine the values of all live nodes. The active window of a key
//! is the most recent unexpired window started after the newest reset marker.
//!
//! A node only ever deletes its own keys: expired windows, and reset markers
//! older than the longest window they could still be hiding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::ratelimit::MAX_WINDOW;

const COUNTER_PREFIX: &str = "counter|";
const RESET_PREFIX: &str = "reset|";

/// Own keys are swept once every this many increments.
const PURGE_EVERY: u64 = 256;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl ClusterConfig {
    /// Default configuration listening on `listen_addr`.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr,
            advertise_addr: listen_addr,
            seed_nodes: Vec::new(),
            cluster_id: "hivecount".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// One node's contribution to a counter window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    pub window_start_ms: i64,
    pub expires_at_ms: i64,
    pub count: u64,
}

impl WindowEntry {
    /// Encode as a chitchat value.
    pub fn to_value(&self) -> String {
        format!(
            "{}:{}:{}",
            self.window_start_ms, self.expires_at_ms, self.count
        )
    }

    /// Parse a chitchat value.
    pub fn from_value(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, ':');
        let window_start_ms = parts.next()?.parse().ok()?;
        let expires_at_ms = parts.next()?.parse().ok()?;
        let count = parts.next()?.parse().ok()?;
        Some(Self {
            window_start_ms,
            expires_at_ms,
            count,
        })
    }
}

/// The window of a key as seen across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterWindow {
    pub window_start_ms: i64,
    pub expires_at_ms: i64,
    /// Sum of all live nodes' contributions
    pub total: u64,
}

fn counter_key(key: &str) -> String {
    format!("{}{}", COUNTER_PREFIX, key)
}

fn reset_key(key: &str) -> String {
    format!("{}{}", RESET_PREFIX, key)
}

fn max_window_ms() -> i64 {
    i64::try_from(MAX_WINDOW.as_millis()).unwrap_or(i64::MAX)
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
    /// Increments since start, paces the sweep of stale keys
    increments: AtomicU64,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
            increments: AtomicU64::new(0),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add one hit to `key` and return the cluster-wide window.
    ///
    /// Joins the active window if there is one, otherwise opens a new window
    /// of `window_ms` starting at `now_ms` (or just after the newest reset).
    pub async fn increment_counter(&self, key: &str, window_ms: i64, now_ms: i64) -> ClusterWindow {
        let chitchat_key = counter_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let reset_at = Self::latest_reset(&chitchat, &reset_key(key));
        let active = Self::active_window(&chitchat, &chitchat_key, reset_at, now_ms);

        let own: Option<WindowEntry> = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(WindowEntry::from_value);

        let (entry, window) = match active {
            Some(window) => {
                let count = match own {
                    Some(own) if own.window_start_ms == window.window_start_ms => {
                        own.count.saturating_add(1)
                    }
                    _ => 1,
                };
                let entry = WindowEntry {
                    window_start_ms: window.window_start_ms,
                    expires_at_ms: window.expires_at_ms,
                    count,
                };
                (
                    entry,
                    ClusterWindow {
                        total: window.total.saturating_add(1),
                        ..window
                    },
                )
            }
            None => {
                let start = match reset_at {
                    Some(reset_at) => now_ms.max(reset_at.saturating_add(1)),
                    None => now_ms,
                };
                let entry = WindowEntry {
                    window_start_ms: start,
                    expires_at_ms: start.saturating_add(window_ms),
                    count: 1,
                };
                (
                    entry,
                    ClusterWindow {
                        window_start_ms: entry.window_start_ms,
                        expires_at_ms: entry.expires_at_ms,
                        total: 1,
                    },
                )
            }
        };

        chitchat.self_node_state().set(&chitchat_key, entry.to_value());

        debug!(
            key = %chitchat_key,
            local_value = entry.count,
            total = window.total,
            "Incremented local counter"
        );

        if self.increments.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            Self::purge_own_keys(&mut chitchat, now_ms);
        }

        window
    }

    /// Get the active window for `key` across all nodes, if any.
    pub async fn get_window(&self, key: &str, now_ms: i64) -> Option<ClusterWindow> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        let reset_at = Self::latest_reset(&chitchat, &reset_key(key));
        Self::active_window(&chitchat, &counter_key(key), reset_at, now_ms)
    }

    /// Publish a reset marker, discarding every window started before it.
    pub async fn reset_counter(&self, key: &str, now_ms: i64) {
        let marker_key = reset_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let reset_at = match Self::latest_reset(&chitchat, &marker_key) {
            Some(previous) => now_ms.max(previous.saturating_add(1)),
            None => now_ms,
        };
        chitchat.self_node_state().set(&marker_key, reset_at.to_string());

        debug!(key = %marker_key, reset_at = reset_at, "Published counter reset");
    }

    /// Delete this node's expired windows and outdated reset markers.
    ///
    /// Returns how many keys were deleted.
    pub async fn purge_expired(&self, now_ms: i64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        Self::purge_own_keys(&mut chitchat, now_ms)
    }

    fn purge_own_keys(chitchat: &mut Chitchat, now_ms: i64) -> usize {
        // No window started before a marker can outlive it by more than this
        let marker_ttl_ms = max_window_ms();

        let node_state = chitchat.self_node_state();
        let stale: Vec<String> = node_state
            .key_values()
            .filter(|(key, value)| {
                if key.starts_with(COUNTER_PREFIX) {
                    WindowEntry::from_value(value)
                        .map_or(true, |entry| entry.expires_at_ms <= now_ms)
                } else if key.starts_with(RESET_PREFIX) {
                    value
                        .parse::<i64>()
                        .map_or(true, |reset_at| reset_at.saturating_add(marker_ttl_ms) < now_ms)
                } else {
                    false
                }
            })
            .map(|(key, _)| key.to_string())
            .collect();

        for key in &stale {
            node_state.delete(key);
        }
        if !stale.is_empty() {
            debug!(purged = stale.len(), "Purged stale cluster keys");
        }
        stale.len()
    }

    /// Newest reset marker across live nodes.
    fn latest_reset(chitchat: &Chitchat, key: &str) -> Option<i64> {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|node_state| node_state.get(key))
            .filter_map(|value| value.parse::<i64>().ok())
            .max()
    }

    /// Combine live nodes' contributions into the active window.
    fn active_window(
        chitchat: &Chitchat,
        key: &str,
        reset_at: Option<i64>,
        now_ms: i64,
    ) -> Option<ClusterWindow> {
        let entries: Vec<WindowEntry> = chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|node_state| node_state.get(key))
            .filter_map(WindowEntry::from_value)
            .filter(|entry| entry.expires_at_ms > now_ms)
            .filter(|entry| reset_at.map_or(true, |reset_at| entry.window_start_ms > reset_at))
            .collect();

        let start = entries.iter().map(|entry| entry.window_start_ms).max()?;

        let mut window = ClusterWindow {
            window_start_ms: start,
            expires_at_ms: start,
            total: 0,
        };
        for entry in entries.iter().filter(|entry| entry.window_start_ms == start) {
            window.total = window.total.saturating_add(entry.count);
            window.expires_at_ms = window.expires_at_ms.max(entry.expires_at_ms);
        }
        Some(window)
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
