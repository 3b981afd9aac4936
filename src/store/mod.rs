//! Record Store
//!
//! Holds the authoritative value of every key together with its causal
//! metadata. Local writes, pushed records and pulled records for the same
//! key are serialized through a per-key lock; different keys never block
//! each other.

mod backend;
pub mod record;
mod sqlite;

pub use backend::{MemoryBackend, StorageBackend};
pub use record::{wall_clock_now, Record};
pub use sqlite::SqliteBackend;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::id::{Counter, CounterAllocator, NodeId};
use crate::resolver::{self, MergeOutcome};

/// Per-key async locks
#[derive(Default)]
struct KeyLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Merge and write counters
#[derive(Default)]
struct StoreCounters {
    puts: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    resolved: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of the store counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub puts: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub resolved_conflicts: u64,
    pub malformed: u64,
}

/// What a node reports when a neighbor asks what it holds
///
/// `clock` is the entrywise max of every stored clock. A record can be
/// stored without raising it (a late copy of an older write), so
/// `generation` counts exactly those saves. Every save moves one of the two.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSummary {
    pub clock: VectorClock,
    pub generation: u64,
}

/// Authoritative key -> record mapping for this node
pub struct RecordStore {
    allocator: CounterAllocator,
    backend: Arc<dyn StorageBackend>,
    key_locks: KeyLocks,
    /// Node clock (including our own counter) and generation
    summary: RwLock<ClockSummary>,
    counters: StoreCounters,
}

impl RecordStore {
    /// Open the store, restoring the counter and node clock from `backend`
    pub async fn open(node_id: NodeId, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        if node_id.is_empty() {
            return Err(Error::Config("node ID cannot be empty".into()));
        }

        let allocator = CounterAllocator::load(node_id.clone(), Arc::clone(&backend)).await?;
        let mut node_clock = backend.load_node_clock().await?;

        // A clock entry above the persisted counter means the counter row
        // was lost; never issue below what we already published.
        let published = node_clock.get(&node_id);
        allocator.advance_to(published).await?;
        node_clock.observe(&node_id, allocator.last_issued().await);
        let generation = backend.load_generation().await?;

        tracing::info!(
            "Record store opened on {} backend, node {} at counter {} generation {}",
            backend.name(),
            node_id,
            allocator.last_issued().await,
            generation
        );

        Ok(Self {
            allocator,
            backend,
            key_locks: KeyLocks::default(),
            summary: RwLock::new(ClockSummary {
                clock: node_clock,
                generation,
            }),
            counters: StoreCounters::default(),
        })
    }

    /// This node's identifier
    pub fn node_id(&self) -> &NodeId {
        self.allocator.node_id()
    }

    /// Write a value locally
    ///
    /// The new record's clock is the key's previous clock with this node's
    /// entry bumped to the freshly issued counter. Local writes are never
    /// rejected by conflict resolution.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<Record> {
        if key.is_empty() {
            return Err(Error::MalformedRecord("empty key".into()));
        }

        let _guard = self.key_locks.lock(key).await;
        let previous = self.backend.load_record(key).await?;

        let version = self.allocator.next_version().await?;
        let mut clock = previous.map(|r| r.clock).unwrap_or_default();
        clock.observe(&version.node, version.counter);

        let record = Record {
            key: key.to_string(),
            value,
            version,
            clock,
            timestamp: wall_clock_now(),
        };

        self.backend.save_record(&record).await?;
        self.absorb(&record.clock, true).await?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Put {} at {} clock {}", record.key, record.version, record.clock);
        Ok(record)
    }

    /// Read the stored record for `key`
    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        self.backend.load_record(key).await
    }

    /// Merge a record received from another node
    ///
    /// Malformed records are rejected with [`Error::MalformedRecord`]
    /// before anything is touched.
    pub async fn merge(&self, incoming: Record) -> Result<MergeOutcome> {
        if let Err(e) = incoming.validate() {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Rejecting malformed record: {}", e);
            return Err(e);
        }

        let _guard = self.key_locks.lock(&incoming.key).await;

        // Someone has seen writes from us that we no longer remember
        let own = incoming.clock.get(self.node_id());
        if own > self.allocator.last_issued().await {
            tracing::warn!(
                "Record {} carries counter {} for this node; advancing allocator",
                incoming.key,
                own
            );
            self.allocator.advance_to(own).await?;
        }

        let (outcome, stored) = match self.backend.load_record(&incoming.key).await? {
            None => (MergeOutcome::Accepted, Some(incoming)),
            Some(current) => {
                let resolution = resolver::resolve(&current, &incoming);
                let changed = resolution.changed(&current);
                (resolution.outcome, changed.then_some(resolution.record))
            }
        };

        if let Some(record) = stored {
            self.backend.save_record(&record).await?;
            self.absorb(&record.clock, true).await?;
        }

        match outcome {
            MergeOutcome::Accepted => &self.counters.accepted,
            MergeOutcome::Rejected => &self.counters.rejected,
            MergeOutcome::ResolvedConflict { .. } => &self.counters.resolved,
        }
        .fetch_add(1, Ordering::Relaxed);

        Ok(outcome)
    }

    /// Summary of all history this node has absorbed
    pub async fn node_clock(&self) -> VectorClock {
        self.summary.read().await.clock.clone()
    }

    /// Node clock and generation, read together
    pub async fn summary(&self) -> ClockSummary {
        self.summary.read().await.clone()
    }

    /// Most recently written records, newest first
    pub async fn list(&self, limit: usize) -> Result<Vec<Record>> {
        self.backend.recent_records(limit).await
    }

    /// Every stored record
    pub async fn all_records(&self) -> Result<Vec<Record>> {
        self.backend.all_records().await
    }

    /// Records whose clock carries history from `origin`
    pub async fn records_since_origin(&self, origin: &NodeId) -> Result<Vec<Record>> {
        self.backend.records_with_origin(origin).await
    }

    /// Make sure future counters exceed `observed`
    ///
    /// Used at startup with the highest counter any neighbor has recorded
    /// for this node.
    pub async fn recover_counter(&self, observed: Counter) -> Result<bool> {
        let advanced = self.allocator.advance_to(observed).await?;
        if advanced {
            let mut own = VectorClock::new();
            own.observe(self.node_id(), observed);
            self.absorb(&own, false).await?;
        }
        Ok(advanced)
    }

    /// Last counter issued by this node
    pub async fn last_counter(&self) -> Counter {
        self.allocator.last_issued().await
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            puts: self.counters.puts.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            resolved_conflicts: self.counters.resolved.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }

    /// Fold a clock into the node clock and persist it
    ///
    /// Called after the record is saved, so a neighbor that sees the new
    /// summary also finds the record. A stored record that leaves the
    /// clock unchanged bumps the generation instead.
    async fn absorb(&self, clock: &VectorClock, stored: bool) -> Result<()> {
        let mut summary = self.summary.write().await;
        let merged = summary.clock.merge(clock);
        if merged != summary.clock {
            self.backend.save_node_clock(&merged).await?;
            summary.clock = merged;
        } else if stored {
            let generation = summary.generation + 1;
            self.backend.save_generation(generation).await?;
            summary.generation = generation;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::VersionId;
    use crate::resolver::Side;
    use chrono::{TimeZone, Utc};

    async fn store(node: &str) -> RecordStore {
        RecordStore::open(NodeId::from(node), Arc::new(MemoryBackend::new()))
            .await
            .unwrap()
    }

    fn foreign(value: &str, node: &str, counter: u64, clock: &[(&str, u64)], ts_ms: i64) -> Record {
        Record {
            key: "x".to_string(),
            value: value.as_bytes().to_vec(),
            version: VersionId::new(NodeId::from(node), counter),
            clock: clock.iter().map(|(n, c)| (NodeId::from(*n), *c)).collect(),
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_put_bumps_own_entry_on_previous_clock() {
        let store = store("a").await;
        store
            .merge(foreign("remote", "b", 3, &[("b", 3)], 1_000))
            .await
            .unwrap();

        let rec = store.put("x", b"local".to_vec()).await.unwrap();
        assert_eq!(rec.version, VersionId::new(NodeId::from("a"), 1));
        assert_eq!(rec.clock.get(&NodeId::from("a")), 1);
        assert_eq!(rec.clock.get(&NodeId::from("b")), 3);

        let again = store.put("x", b"local2".to_vec()).await.unwrap();
        assert_eq!(again.clock.get(&NodeId::from("a")), 2);
        assert_eq!(store.get("x").await.unwrap(), Some(again));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = store("c").await;
        store.put("x", b"mine".to_vec()).await.unwrap();
        let incoming = foreign("theirs", "b", 7, &[("b", 7)], 4_102_444_800_000);

        let first = store.merge(incoming.clone()).await.unwrap();
        let after_first = store.get("x").await.unwrap();
        let second = store.merge(incoming).await.unwrap();

        assert_eq!(first, MergeOutcome::ResolvedConflict { kept: Side::Incoming });
        assert_eq!(second, MergeOutcome::Rejected);
        assert_eq!(store.get("x").await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_causal_dominance_regardless_of_order() {
        let older = foreign("old", "a", 1, &[("a", 1)], 9_000);
        let newer = foreign("new", "b", 1, &[("a", 1), ("b", 1)], 1_000);

        let s1 = store("n1").await;
        s1.merge(older.clone()).await.unwrap();
        assert_eq!(s1.merge(newer.clone()).await.unwrap(), MergeOutcome::Accepted);

        let s2 = store("n2").await;
        s2.merge(newer).await.unwrap();
        assert_eq!(s2.merge(older).await.unwrap(), MergeOutcome::Rejected);

        assert_eq!(s1.get("x").await.unwrap(), s2.get("x").await.unwrap());
        assert_eq!(s1.get("x").await.unwrap().unwrap().value, b"new");
    }

    #[tokio::test]
    async fn test_malformed_record_leaves_store_untouched() {
        let store = store("a").await;
        let good = store.put("x", b"v".to_vec()).await.unwrap();
        let bad = foreign("evil", "b", 0, &[("b", 9)], 1_000);

        let err = store.merge(bad).await.unwrap_err();
        assert!(matches!(err, Error::MalformedRecord(_)));
        assert_eq!(store.get("x").await.unwrap(), Some(good));
        assert_eq!(store.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_node_clock_tracks_absorbed_history() {
        let store = store("a").await;
        store.put("k1", b"1".to_vec()).await.unwrap();
        store
            .merge(foreign("2", "b", 4, &[("b", 4), ("c", 2)], 1_000))
            .await
            .unwrap();

        let clock = store.node_clock().await;
        assert_eq!(clock.get(&NodeId::from("a")), 1);
        assert_eq!(clock.get(&NodeId::from("b")), 4);
        assert_eq!(clock.get(&NodeId::from("c")), 2);
    }

    #[tokio::test]
    async fn test_foreign_copy_of_own_counter_advances_allocator() {
        let store = store("a").await;
        store
            .merge(foreign("lost", "a", 12, &[("a", 12)], 1_000))
            .await
            .unwrap();

        let rec = store.put("y", b"v".to_vec()).await.unwrap();
        assert_eq!(rec.version.counter, 13);
    }

    #[tokio::test]
    async fn test_reopen_resumes_counter_and_clock() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        {
            let store = RecordStore::open(NodeId::from("a"), Arc::clone(&backend)).await.unwrap();
            store.put("x", b"1".to_vec()).await.unwrap();
            store.put("x", b"2".to_vec()).await.unwrap();
        }

        let store = RecordStore::open(NodeId::from("a"), backend).await.unwrap();
        assert_eq!(store.last_counter().await, 2);
        assert_eq!(store.node_clock().await.get(&NodeId::from("a")), 2);
        assert_eq!(store.put("x", b"3".to_vec()).await.unwrap().version.counter, 3);
    }

    #[tokio::test]
    async fn test_every_save_moves_the_summary() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let store = RecordStore::open(NodeId::from("b"), Arc::clone(&backend)).await.unwrap();

        let newer = foreign("2", "a", 2, &[("a", 2)], 2_000);
        let mut older = foreign("1", "a", 1, &[("a", 1)], 1_000);
        older.key = "k1".to_string();

        store.merge(newer).await.unwrap();
        let before = store.summary().await;
        assert_eq!(before.generation, 0);

        // Late copy of an older write: clock stays put, generation moves
        assert_eq!(store.merge(older.clone()).await.unwrap(), MergeOutcome::Accepted);
        let after = store.summary().await;
        assert_eq!(after.clock, before.clock);
        assert_eq!(after.generation, 1);

        // Duplicates store nothing
        assert_eq!(store.merge(older).await.unwrap(), MergeOutcome::Rejected);
        assert_eq!(store.summary().await, after);

        // Local writes raise the clock
        store.put("k2", b"v".to_vec()).await.unwrap();
        assert_eq!(store.summary().await.generation, 1);

        drop(store);
        let store = RecordStore::open(NodeId::from("b"), backend).await.unwrap();
        assert_eq!(store.summary().await.generation, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_key_are_serialized() {
        let store = Arc::new(store("a").await);
        let mut handles = vec![];
        for i in 0..16u8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.put("hot", vec![i]).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rec = store.get("hot").await.unwrap().unwrap();
        assert_eq!(rec.version.counter, 16);
        assert_eq!(rec.clock.get(&NodeId::from("a")), 16);
        assert_eq!(store.stats().puts, 16);
    }
}
