//! Neighbor Membership
//!
//! Membership is owned by an external control plane; this module only
//! observes it. Both the gossip pusher and the anti-entropy reconciler ask
//! a [`NeighborList`] for the current neighbors every time they need them.

use std::path::PathBuf;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::id::NodeId;

/// A directly connected cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Unique node identifier
    pub id: NodeId,
    /// Peer protocol address (host:port)
    pub address: String,
    /// Reported reachable by the control plane
    #[serde(default = "default_online")]
    pub online: bool,
}

impl Neighbor {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            online: true,
        }
    }
}

fn default_online() -> bool {
    true
}

/// Control-plane view of this node's neighbors
#[async_trait]
pub trait NeighborList: Send + Sync {
    /// Current neighbors, excluding this node
    async fn neighbors(&self) -> Result<Vec<Neighbor>>;

    /// Neighbors the control plane reports as online
    async fn online_neighbors(&self) -> Result<Vec<Neighbor>> {
        Ok(self
            .neighbors()
            .await?
            .into_iter()
            .filter(|n| n.online)
            .collect())
    }
}

/// Fixed neighbor list from configuration
pub struct StaticNeighbors {
    neighbors: Vec<Neighbor>,
}

impl StaticNeighbors {
    /// Build the list, dropping any entry that names this node
    pub fn new(self_id: &NodeId, neighbors: Vec<Neighbor>) -> Self {
        let neighbors = neighbors
            .into_iter()
            .filter(|n| {
                if &n.id == self_id {
                    tracing::debug!("Skipping neighbor {} (that's us)", n.id);
                    false
                } else {
                    true
                }
            })
            .collect();
        Self { neighbors }
    }
}

#[async_trait]
impl NeighborList for StaticNeighbors {
    async fn neighbors(&self) -> Result<Vec<Neighbor>> {
        Ok(self.neighbors.clone())
    }
}

/// Neighbor list maintained by an external control plane as a JSON file
///
/// The file holds an array of neighbors and is re-read on every call, so
/// rewrites are picked up without a restart. If a rewrite cannot be read
/// the last good list is kept.
pub struct NeighborsFile {
    path: PathBuf,
    self_id: NodeId,
    last_good: RwLock<Vec<Neighbor>>,
}

impl NeighborsFile {
    pub fn new(path: PathBuf, self_id: NodeId) -> Self {
        Self {
            path,
            self_id,
            last_good: RwLock::new(Vec::new()),
        }
    }

    async fn read(&self) -> Result<Vec<Neighbor>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let neighbors: Vec<Neighbor> = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Invalid neighbors file {:?}: {}", self.path, e))
        })?;
        Ok(neighbors
            .into_iter()
            .filter(|n| n.id != self.self_id)
            .collect())
    }
}

#[async_trait]
impl NeighborList for NeighborsFile {
    async fn neighbors(&self) -> Result<Vec<Neighbor>> {
        match self.read().await {
            Ok(neighbors) => {
                let mut last = self.last_good.write().await;
                if *last != neighbors {
                    tracing::info!("Neighbor list changed: {} neighbors", neighbors.len());
                    *last = neighbors.clone();
                }
                Ok(neighbors)
            }
            Err(e) => {
                tracing::warn!("Failed to reload neighbors from {:?}: {}", self.path, e);
                Ok(self.last_good.read().await.clone())
            }
        }
    }
}
