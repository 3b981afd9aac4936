//! Slate - Gossip-Replicated Key/Value Store
//!
//! An eventually consistent key/value layer for small clusters of peers.
//! Every node accepts writes locally and spreads them two ways:
//!
//! - a best-effort push of each fresh record to every online neighbor
//! - a periodic anti-entropy round that compares vector clock summaries
//!   and pulls whatever a neighbor has that this node has not seen
//!
//! # Architecture
//!
//! Records carry a vector clock and a `(node, counter)` version. Incoming
//! records are merged by causal dominance; truly concurrent writes are
//! settled deterministically by timestamp and then version, so every node
//! converges on the same value once it has seen the same writes.
//!
//! # Features
//!
//! - SQLite or in-memory record storage with optional LZ4 value compression
//! - Crash-safe per-node counters, recoverable from neighbors
//! - Framed, checksummed TCP peer protocol
//! - Static or control-plane-managed neighbor lists
//! - HTTP API for local clients

pub mod config;
pub mod error;
pub mod id;
pub mod clock;
pub mod store;
pub mod resolver;
pub mod membership;
pub mod network;
pub mod replication;
pub mod node;
pub mod api;

pub use config::SlateConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SlateConfig;
    pub use crate::error::{Error, Result};
    pub use crate::clock::{CausalOrder, VectorClock};
    pub use crate::id::{Counter, NodeId, VersionId};
    pub use crate::store::{ClockSummary, Record, RecordStore, StorageBackend};
    pub use crate::resolver::MergeOutcome;
    pub use crate::membership::{Neighbor, NeighborList};
    pub use crate::replication::{PeerMessage, PeerTransport};
    pub use crate::node::Node;
}
