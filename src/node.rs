//! Slate Node
//!
//! Wires the record store to the replication tasks and serves the peer
//! protocol. Local writes go through [`Node::put`], which stores the record
//! and hands it to the gossip pusher before returning.

use std::sync::Arc;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::membership::{Neighbor, NeighborList};
use crate::network::MessageHandler;
use crate::replication::{
    AntiEntropyReconciler, ErrorCode, GossipPusher, PeerMessage, PeerTransport, PushStats,
    ReplicationConfig, RoundReport,
};
use crate::resolver::MergeOutcome;
use crate::store::{ClockSummary, Record, RecordStore, StorageBackend, StoreStats};

/// Counters from every component of the node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub store: StoreStats,
    pub push: PushStats,
    pub anti_entropy_rounds: u64,
    pub last_counter: u64,
}

/// A single replica
pub struct Node {
    store: Arc<RecordStore>,
    neighbors: Arc<dyn NeighborList>,
    pusher: GossipPusher,
    reconciler: Arc<AntiEntropyReconciler>,
    config: ReplicationConfig,
}

impl Node {
    /// Open the store and start the gossip pusher
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn new(
        node_id: NodeId,
        backend: Arc<dyn StorageBackend>,
        neighbors: Arc<dyn NeighborList>,
        transport: Arc<dyn PeerTransport>,
        config: ReplicationConfig,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(RecordStore::open(node_id, backend).await?);
        let pusher = GossipPusher::spawn(
            Arc::clone(&neighbors),
            Arc::clone(&transport),
            config.push_queue_size,
        );
        let reconciler = Arc::new(AntiEntropyReconciler::new(
            Arc::clone(&store),
            Arc::clone(&neighbors),
            transport,
        ));

        Ok(Arc::new(Self {
            store,
            neighbors,
            pusher,
            reconciler,
            config,
        }))
    }

    pub fn node_id(&self) -> &NodeId {
        self.store.node_id()
    }

    /// Write locally and queue the record for gossip
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<Record> {
        let record = self.store.put(key, value).await?;
        self.pusher.enqueue(record.clone());
        Ok(record)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        self.store.get(key).await
    }

    /// Most recent records, newest first
    pub async fn list(&self, limit: usize) -> Result<Vec<Record>> {
        self.store.list(limit).await
    }

    /// Merge a record received from a neighbor
    pub async fn merge(&self, record: Record) -> Result<MergeOutcome> {
        self.store.merge(record).await
    }

    pub async fn clock(&self) -> VectorClock {
        self.store.node_clock().await
    }

    /// Node clock and generation as reported to neighbors
    pub async fn summary(&self) -> ClockSummary {
        self.store.summary().await
    }

    pub async fn neighbors(&self) -> Result<Vec<Neighbor>> {
        self.neighbors.neighbors().await
    }

    pub fn reconciler(&self) -> &AntiEntropyReconciler {
        &self.reconciler
    }

    /// Run one anti-entropy round now
    pub async fn run_anti_entropy(&self) -> Result<RoundReport> {
        self.reconciler.run_round().await
    }

    /// Advance our counter past anything a neighbor has seen from us
    ///
    /// Covers a restart with a lost or rolled-back database. Returns
    /// whether the counter moved.
    pub async fn recover_counter(&self) -> Result<bool> {
        let (observed, answered) = self.reconciler.highest_observed_counter().await?;
        let advanced = self.store.recover_counter(observed).await?;

        if advanced {
            tracing::warn!(
                "Neighbors have seen counter {} from us; resuming above it",
                observed
            );
        } else {
            tracing::info!(
                "Counter recovery: {} neighbor(s) answered, local counter {} is current",
                answered,
                self.store.last_counter().await
            );
        }
        Ok(advanced)
    }

    /// Start the periodic anti-entropy task
    pub fn spawn_anti_entropy(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(reconciler.run(
            self.config.anti_entropy_interval,
            self.config.anti_entropy_jitter,
            shutdown,
        ))
    }

    pub async fn stats(&self) -> NodeStats {
        NodeStats {
            store: self.store.stats(),
            push: self.pusher.stats(),
            anti_entropy_rounds: self.reconciler.rounds(),
            last_counter: self.store.last_counter().await,
        }
    }

    async fn serve_pull(&self, since_origin: Option<NodeId>) -> Result<Vec<Record>> {
        match since_origin {
            Some(origin) => self.store.records_since_origin(&origin).await,
            None => self.store.all_records().await,
        }
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle(&self, peer_addr: &str, message: PeerMessage) -> Option<PeerMessage> {
        match message {
            PeerMessage::Push { record } => {
                let key = record.key.clone();
                match self.store.merge(record).await {
                    Ok(outcome) => {
                        tracing::debug!("Push of {} from {}: {:?}", key, peer_addr, outcome);
                    }
                    Err(Error::MalformedRecord(e)) => {
                        tracing::debug!("Malformed push from {}: {}", peer_addr, e);
                    }
                    Err(e) => {
                        tracing::error!("Failed to merge push of {} from {}: {}", key, peer_addr, e);
                    }
                }
                None
            }

            PeerMessage::ClockRequest => Some(PeerMessage::ClockResponse {
                node_id: self.node_id().clone(),
                summary: self.store.summary().await,
            }),

            PeerMessage::PullRequest { since_origin } => match self.serve_pull(since_origin).await {
                Ok(records) => {
                    tracing::debug!("Serving {} records to {}", records.len(), peer_addr);
                    Some(PeerMessage::PullResponse { records })
                }
                Err(e) => {
                    tracing::error!("Pull from {} failed: {}", peer_addr, e);
                    Some(PeerMessage::Error {
                        code: ErrorCode::Storage,
                        message: e.to_string(),
                    })
                }
            },

            other => {
                tracing::warn!("Unexpected {} from {}", other.type_name(), peer_addr);
                other.expects_reply().then(|| PeerMessage::Error {
                    code: ErrorCode::Unsupported,
                    message: format!("{} not served", other.type_name()),
                })
            }
        }
    }
}
