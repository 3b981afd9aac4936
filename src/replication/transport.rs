//! Peer Transport
//!
//! The replication tasks only need three exchanges with a neighbor. Keeping
//! them behind a trait lets tests wire nodes together in memory.

use std::time::Duration;
use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::membership::Neighbor;
use crate::network::NetworkClient;
use crate::replication::PeerMessage;
use crate::store::{ClockSummary, Record};

/// Exchanges with a single neighbor
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Hand a record to a neighbor without waiting for it to be applied
    async fn push(&self, neighbor: &Neighbor, record: &Record) -> Result<()>;

    /// Fetch the neighbor's node clock and generation
    async fn fetch_clock(&self, neighbor: &Neighbor) -> Result<ClockSummary>;

    /// Fetch the neighbor's records, optionally only those touched by one origin
    async fn pull(&self, neighbor: &Neighbor, since_origin: Option<&NodeId>) -> Result<Vec<Record>>;

    /// Release connections unused for longer than `max_idle`
    async fn prune_idle(&self, _max_idle: Duration) {}

    /// Release every connection
    async fn close(&self) {}
}

/// Transport over the framed TCP peer protocol
pub struct TcpTransport {
    client: NetworkClient,
}

impl TcpTransport {
    pub fn new(client: NetworkClient) -> Self {
        Self { client }
    }

    fn unexpected(neighbor: &Neighbor, response: PeerMessage) -> Error {
        let got = match response {
            PeerMessage::Error { code, message } => format!("{:?}: {}", code, message),
            other => other.type_name().to_string(),
        };
        Error::UnexpectedResponse {
            peer: neighbor.id.to_string(),
            got,
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn push(&self, neighbor: &Neighbor, record: &Record) -> Result<()> {
        let message = PeerMessage::Push {
            record: record.clone(),
        };
        self.client.send_async(&neighbor.address, message).await
    }

    async fn fetch_clock(&self, neighbor: &Neighbor) -> Result<ClockSummary> {
        match self.client.send(&neighbor.address, PeerMessage::ClockRequest).await? {
            PeerMessage::ClockResponse { node_id, summary } => {
                if node_id != neighbor.id {
                    tracing::warn!(
                        "Neighbor at {} answered as {} (expected {})",
                        neighbor.address,
                        node_id,
                        neighbor.id
                    );
                }
                Ok(summary)
            }
            other => Err(Self::unexpected(neighbor, other)),
        }
    }

    async fn pull(&self, neighbor: &Neighbor, since_origin: Option<&NodeId>) -> Result<Vec<Record>> {
        let request = PeerMessage::PullRequest {
            since_origin: since_origin.cloned(),
        };
        match self.client.send(&neighbor.address, request).await? {
            PeerMessage::PullResponse { records } => Ok(records),
            other => Err(Self::unexpected(neighbor, other)),
        }
    }

    async fn prune_idle(&self, max_idle: Duration) {
        self.client.cleanup_stale(max_idle).await;
    }

    async fn close(&self) {
        self.client.close_all().await;
    }
}
