//! Replicated record type

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::id::{VersionId, MAX_COUNTER};

/// Latest accepted value of a key and its causal metadata
///
/// This is also the wire shape of pushed and pulled records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
    /// Write event that produced `value`
    pub version: VersionId,
    /// All history absorbed into this record, not just the writer's
    pub clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Reject records that cannot have been produced by a correct node
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::MalformedRecord("empty key".into()));
        }
        if self.version.node.is_empty() {
            return Err(Error::MalformedRecord(format!(
                "key {}: version has empty node ID",
                self.key
            )));
        }
        if self.version.counter == 0 {
            return Err(Error::MalformedRecord(format!(
                "key {}: version {} has zero counter",
                self.key, self.version
            )));
        }
        if let Some((node, counter)) = self.clock.iter().find(|(_, c)| **c > MAX_COUNTER) {
            return Err(Error::MalformedRecord(format!(
                "key {}: clock entry {}:{} out of range",
                self.key, node, counter
            )));
        }
        if self.clock.get(&self.version.node) < self.version.counter {
            return Err(Error::MalformedRecord(format!(
                "key {}: clock {} does not cover version {}",
                self.key, self.clock, self.version
            )));
        }
        Ok(())
    }
}

/// Current wall clock, truncated to milliseconds
///
/// Timestamps take part in tiebreaks, so every node must see the same value
/// after a round trip through storage or the wire.
pub fn wall_clock_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
