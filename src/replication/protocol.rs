//! Replication Protocol
//!
//! Defines the wire protocol spoken between neighbors.

use serde::{Deserialize, Serialize};

use crate::id::NodeId;
use crate::store::{ClockSummary, Record};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    // ========== Gossip ==========
    /// Freshly written record (fire-and-forget, never answered)
    Push { record: Record },

    // ========== Anti-Entropy ==========
    /// Ask for the node clock summary
    ClockRequest,

    /// Node clock and generation
    ClockResponse { node_id: NodeId, summary: ClockSummary },

    /// Ask for records, optionally only those carrying history from one origin
    PullRequest { since_origin: Option<NodeId> },

    /// Complete pull result; merged all-or-nothing by the requester
    PullResponse { records: Vec<Record> },

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Request type not served by this node
    Unsupported,
    /// Storage failed while serving the request
    Storage,
    /// Internal error
    Internal,
}

impl PeerMessage {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Push { .. } => "Push",
            PeerMessage::ClockRequest => "ClockRequest",
            PeerMessage::ClockResponse { .. } => "ClockResponse",
            PeerMessage::PullRequest { .. } => "PullRequest",
            PeerMessage::PullResponse { .. } => "PullResponse",
            PeerMessage::Error { .. } => "Error",
        }
    }

    /// True if the sender waits for a reply
    pub fn expects_reply(&self) -> bool {
        matches!(self, PeerMessage::ClockRequest | PeerMessage::PullRequest { .. })
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    ///
    /// The length saturates; bodies over [`MAX_FRAME_SIZE`] must not be sent.
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: u32::try_from(data.len()).unwrap_or(u32::MAX),
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::id::VersionId;
    use crate::store::wall_clock_now;

    #[test]
    fn test_push_serialization() {
        let node = NodeId::from("node-1");
        let mut clock = VectorClock::new();
        clock.observe(&node, 5);
        clock.observe(&NodeId::from("node-2"), 7);

        let msg = PeerMessage::Push {
            record: Record {
                key: "x".to_string(),
                value: vec![0, 159, 146, 150],
                version: VersionId::new(node, 5),
                clock,
                timestamp: wall_clock_now(),
            },
        };

        let bytes = msg.serialize().unwrap();
        let restored = PeerMessage::deserialize(&bytes).unwrap();
        assert_eq!(restored, msg);
        assert!(!restored.expects_reply());
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
