//! Peer Mesh networking module using Chitchat.
//!
//! This module implements the gossip mesh used by the `mesh` counter
//! backend. Nodes share fixed window counters without any central store,
//! using the chitchat library for cluster membership and state
//! dissemination.

mod backend;
mod cluster;

pub use backend::{MeshBackend, MeshSettings};
pub use cluster::{Cluster, ClusterConfig, ClusterError, ClusterWindow, WindowEntry};
