//! Conflict Resolution
//!
//! Decides which of two versions of the same key a node keeps:
//!
//! 1. If one clock dominates the other, the causally later version wins.
//! 2. If the clocks are concurrent, the later timestamp wins; equal
//!    timestamps fall back to the [`VersionId`](crate::id::VersionId) order.
//! 3. Whatever wins, the stored clock is the entrywise maximum of both, so
//!    absorbed history is never forgotten.
//!
//! Resolution is a pure function of the two records, so every node picks
//! the same winner for the same pair.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::clock::CausalOrder;
use crate::store::Record;

/// Which candidate a tiebreak kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Current,
    Incoming,
}

/// Result of merging an incoming record into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Incoming happened after current and replaced it
    Accepted,
    /// Incoming was already known or stale; current retained
    Rejected,
    /// Clocks were concurrent and the tiebreak decided
    ResolvedConflict { kept: Side },
}

impl MergeOutcome {
    /// True if the incoming value is now the stored value
    pub fn incoming_won(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Accepted | MergeOutcome::ResolvedConflict { kept: Side::Incoming }
        )
    }
}

/// Decision plus the record the store must hold afterwards
#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: MergeOutcome,
    pub record: Record,
}

impl Resolution {
    /// True if `record` differs from what was stored before
    pub fn changed(&self, current: &Record) -> bool {
        self.record != *current
    }
}

/// Resolve `incoming` against the currently stored `current`
pub fn resolve(current: &Record, incoming: &Record) -> Resolution {
    let merged_clock = current.clock.merge(&incoming.clock);

    let outcome = match incoming.clock.compare(&current.clock) {
        CausalOrder::After => MergeOutcome::Accepted,
        CausalOrder::Before => MergeOutcome::Rejected,
        CausalOrder::Equal if incoming.version == current.version => MergeOutcome::Rejected,
        CausalOrder::Equal | CausalOrder::Concurrent => MergeOutcome::ResolvedConflict {
            kept: tiebreak(current, incoming),
        },
    };

    let mut record = if outcome.incoming_won() {
        incoming.clone()
    } else {
        current.clone()
    };
    record.clock = merged_clock;

    Resolution { outcome, record }
}

/// Deterministic choice between two causally incomparable versions
pub fn tiebreak(current: &Record, incoming: &Record) -> Side {
    let order = incoming
        .timestamp
        .cmp(&current.timestamp)
        .then_with(|| incoming.version.cmp(&current.version));

    match order {
        Ordering::Greater => Side::Incoming,
        Ordering::Less | Ordering::Equal => Side::Current,
    }
}
