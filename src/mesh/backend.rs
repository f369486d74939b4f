//! Counter backend backed by the gossip mesh.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, trace};

use super::cluster::{Cluster, ClusterConfig, ClusterError};
use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::ratelimit::{window_delta, BackendResult, CounterBackend};

/// Settings accepted by the `mesh` backend kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshSettings {
    /// Gossip listen address
    pub listen_addr: SocketAddr,
    /// Address advertised to peers, defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
    /// Node identifier, random when unset
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,
    /// Upper bound on a liveness check
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
}

fn default_cluster_id() -> String {
    "hivecount".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

fn default_health_check_timeout() -> u64 {
    250
}

impl MeshSettings {
    /// Translate into a cluster configuration.
    pub fn cluster_config(&self) -> ClusterConfig {
        let mut config = ClusterConfig::new(self.listen_addr);
        if let Some(advertise_addr) = self.advertise_addr {
            config.advertise_addr = advertise_addr;
        }
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        config.cluster_id = self.cluster_id.clone();
        config.seed_nodes = self.seed_nodes.clone();
        config.gossip_interval = Duration::from_millis(self.gossip_interval_ms);
        config.dead_node_grace_period = Duration::from_secs(self.dead_node_grace_period_secs);
        config
    }
}

/// A counter backend whose windows are shared by every node of a chitchat
/// cluster.
#[derive(Debug)]
pub struct MeshBackend {
    cluster: Cluster,
    health_check_timeout: Duration,
}

impl MeshBackend {
    /// Join (or start) the cluster described by `config`.
    pub async fn start(config: ClusterConfig, health_check_timeout: Duration) -> Result<Self> {
        let cluster = Cluster::start(config).await?;
        Ok(Self {
            cluster,
            health_check_timeout,
        })
    }

    /// Build from a backend config.
    pub async fn from_config(config: &BackendConfig) -> Result<Self> {
        let settings: MeshSettings = config.typed_settings()?;
        debug!(
            backend = %config.name,
            listen_addr = %settings.listen_addr,
            "Starting mesh backend"
        );
        Self::start(
            settings.cluster_config(),
            Duration::from_millis(settings.health_check_timeout_ms),
        )
        .await
    }

    pub async fn live_node_count(&self) -> usize {
        self.cluster.live_node_count().await
    }

    pub async fn live_nodes(&self) -> Vec<String> {
        self.cluster.live_nodes().await
    }

    /// Leave the cluster.
    pub async fn shutdown(self) -> std::result::Result<(), ClusterError> {
        self.cluster.shutdown().await
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_timestamp(ms: i64) -> BackendResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BackendError::Internal(format!("invalid window timestamp {}", ms)))
}

#[async_trait]
impl CounterBackend for MeshBackend {
    async fn increment(&self, key: &str, window: Duration) -> BackendResult<u64> {
        let window_ms = window_delta(window)?.num_milliseconds().max(1);
        let cluster_window = self.cluster.increment_counter(key, window_ms, now_ms()).await;

        trace!(key = %key, total = cluster_window.total, "Incremented mesh counter");
        Ok(cluster_window.total)
    }

    async fn get_count(&self, key: &str) -> BackendResult<u64> {
        Ok(self
            .cluster
            .get_window(key, now_ms())
            .await
            .map(|window| window.total)
            .unwrap_or(0))
    }

    async fn get_reset_time(&self, key: &str) -> BackendResult<Option<DateTime<Utc>>> {
        self.cluster
            .get_window(key, now_ms())
            .await
            .map(|window| to_timestamp(window.expires_at_ms))
            .transpose()
    }

    async fn reset(&self, key: &str) -> BackendResult<()> {
        self.cluster.reset_counter(key, now_ms()).await;
        Ok(())
    }

    async fn check_health(&self) -> bool {
        match tokio::time::timeout(self.health_check_timeout, self.cluster.live_node_count()).await
        {
            Ok(live) => live > 0,
            Err(_) => {
                debug!(node_id = %self.cluster.node_id(), "Mesh health check timed out");
                false
            }
        }
    }
}
