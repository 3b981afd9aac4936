//! Storage collaborator interface
//!
//! The record store persists records, the node clock, the generation and
//! the last issued counter through a [`StorageBackend`]. Backends only need
//! per-key reads and writes; ordering and filtering helpers have default
//! implementations that scan [`StorageBackend::all_records`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Record;
use crate::clock::VectorClock;
use crate::error::Result;
use crate::id::{Counter, NodeId};

/// Durable storage for replicated state
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name (for logging)
    fn name(&self) -> &'static str;

    async fn load_record(&self, key: &str) -> Result<Option<Record>>;

    async fn save_record(&self, record: &Record) -> Result<()>;

    async fn all_records(&self) -> Result<Vec<Record>>;

    /// Summary of every history absorbed by this node
    async fn load_node_clock(&self) -> Result<VectorClock>;

    /// Persist the node clock; stored entries never decrease
    async fn save_node_clock(&self, clock: &VectorClock) -> Result<()>;

    /// Last counter issued by this node (0 if none)
    async fn load_counter(&self) -> Result<Counter>;

    async fn save_counter(&self, counter: Counter) -> Result<()>;

    /// Saves that did not raise the node clock (0 if none)
    async fn load_generation(&self) -> Result<u64>;

    async fn save_generation(&self, generation: u64) -> Result<()>;

    /// Most recent records by timestamp
    async fn recent_records(&self, limit: usize) -> Result<Vec<Record>> {
        let mut records = self.all_records().await?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.version.cmp(&a.version)));
        records.truncate(limit);
        Ok(records)
    }

    /// Records carrying any history from `origin`
    async fn records_with_origin(&self, origin: &NodeId) -> Result<Vec<Record>> {
        let records = self.all_records().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.clock.get(origin) > 0)
            .collect())
    }
}

/// Volatile backend for tests and the `memory` storage mode
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, Record>>,
    clock: RwLock<VectorClock>,
    counter: AtomicU64,
    generation: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load_record(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save_record(&self, record: &Record) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn all_records(&self) -> Result<Vec<Record>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn load_node_clock(&self) -> Result<VectorClock> {
        Ok(self.clock.read().await.clone())
    }

    async fn save_node_clock(&self, clock: &VectorClock) -> Result<()> {
        self.clock.write().await.merge_in(clock);
        Ok(())
    }

    async fn load_counter(&self) -> Result<Counter> {
        Ok(self.counter.load(Ordering::SeqCst))
    }

    async fn save_counter(&self, counter: Counter) -> Result<()> {
        self.counter.fetch_max(counter, Ordering::SeqCst);
        Ok(())
    }

    async fn load_generation(&self) -> Result<u64> {
        Ok(self.generation.load(Ordering::SeqCst))
    }

    async fn save_generation(&self, generation: u64) -> Result<()> {
        self.generation.store(generation, Ordering::SeqCst);
        Ok(())
    }
}
