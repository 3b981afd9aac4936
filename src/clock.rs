//! Vector Clocks
//!
//! A [`VectorClock`] maps each origin node to the highest counter absorbed
//! from it. Absent entries are zero and zero entries are never stored, so
//! two clocks describing the same history always compare equal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{Counter, NodeId};

/// Causal relation of one clock to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Self happened before other
    Before,
    /// Self happened after other
    After,
    /// Identical history
    Equal,
    /// Neither dominates
    Concurrent,
}

/// Mapping from origin node to highest absorbed counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<NodeId, Counter>", into = "BTreeMap<NodeId, Counter>")]
pub struct VectorClock(BTreeMap<NodeId, Counter>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter recorded for `node` (0 if absent)
    pub fn get(&self, node: &NodeId) -> Counter {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Record that `counter` from `node` has been absorbed
    ///
    /// Entries only move forward; a lower value is ignored.
    pub fn observe(&mut self, node: &NodeId, counter: Counter) {
        if counter == 0 {
            return;
        }
        let entry = self.0.entry(node.clone()).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Entrywise maximum of two clocks
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    /// Fold another clock into this one (entrywise maximum)
    pub fn merge_in(&mut self, other: &VectorClock) {
        for (node, counter) in &other.0 {
            self.observe(node, *counter);
        }
    }

    /// Compare two clocks entrywise
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for node in self.0.keys().chain(other.0.keys()) {
            let mine = self.get(node);
            let theirs = other.get(node);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True if self is >= other on every entry and > on at least one
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::After
    }

    /// Origins for which self reports a higher counter than `baseline`
    pub fn advanced_origins(&self, baseline: &VectorClock) -> Vec<NodeId> {
        self.0
            .iter()
            .filter(|(node, counter)| **counter > baseline.get(node))
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Counter)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<NodeId, Counter>> for VectorClock {
    fn from(entries: BTreeMap<NodeId, Counter>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<VectorClock> for BTreeMap<NodeId, Counter> {
    fn from(clock: VectorClock) -> Self {
        clock.0
    }
}

impl FromIterator<(NodeId, Counter)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, Counter)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (node, counter) in iter {
            clock.observe(&node, counter);
        }
        clock
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(n, c)| format!("{}:{}", n, c)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
