//! Replication Module
//!
//! Moves records between neighbors. Fresh writes are pushed best-effort by
//! the [`GossipPusher`]; anything a push missed is repaired by the periodic
//! [`AntiEntropyReconciler`], which compares clock summaries and pulls only
//! from neighbors that have moved on.

pub mod protocol;
pub mod transport;
mod pusher;
mod reconciler;

pub use protocol::{ErrorCode, FrameHeader, PeerMessage, MAX_FRAME_SIZE};
pub use transport::{PeerTransport, TcpTransport};
pub use pusher::{GossipPusher, PushStats};
pub use reconciler::{
    AntiEntropyReconciler, NeighborClockCache, NeighborHealth, NeighborOutcome, NeighborReport,
    PullPlan, RoundReport,
};

use std::time::Duration;

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Time between anti-entropy rounds
    pub anti_entropy_interval: Duration,
    /// Upper bound of the random delay added to each round
    pub anti_entropy_jitter: Duration,
    /// Pushes waiting to be sent before new ones are dropped
    pub push_queue_size: usize,
    /// Ask neighbors for our own counter before accepting writes
    pub recover_counter_on_start: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            anti_entropy_interval: Duration::from_secs(60),
            anti_entropy_jitter: Duration::from_secs(5),
            push_queue_size: 1024,
            recover_counter_on_start: true,
        }
    }
}
