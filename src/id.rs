//! Node Identity and Version Counters
//!
//! Every write in the cluster is named by a [`VersionId`]: the writing
//! node's [`NodeId`] plus a [`Counter`] that only that node may issue.
//! Uniqueness of node IDs and exclusive ownership of the counter make the
//! pair unique cluster-wide.
//!
//! Counters start at 1; 0 means "nothing issued". They stop at
//! [`MAX_COUNTER`] so they fit a signed 64-bit storage column.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::store::StorageBackend;

/// Per-node monotonic write counter
pub type Counter = u64;

/// Highest counter a node may issue or accept
pub const MAX_COUNTER: Counter = i64::MAX as Counter;

/// Static, unique identifier of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identifier of a single write event
///
/// The derived ordering compares the node ID lexically, then the counter
/// numerically. Every node uses this order to break timestamp ties, so it
/// must never change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId {
    pub node: NodeId,
    pub counter: Counter,
}

impl VersionId {
    pub fn new(node: NodeId, counter: Counter) -> Self {
        Self { node, counter }
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.counter)
    }
}

/// Exclusive owner of this node's counter
///
/// Every issued value is persisted through the storage backend before it
/// is handed out, so a restart resumes above the last issued counter.
pub struct CounterAllocator {
    node_id: NodeId,
    last_issued: Mutex<Counter>,
    backend: Arc<dyn StorageBackend>,
}

impl CounterAllocator {
    /// Load the allocator, resuming from the persisted counter
    pub async fn load(node_id: NodeId, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let last = backend.load_counter().await?;
        tracing::debug!("Counter allocator for {} resuming after {}", node_id, last);

        Ok(Self {
            node_id,
            last_issued: Mutex::new(last),
            backend,
        })
    }

    /// This node's identifier
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Issue the next counter
    ///
    /// Fails with [`Error::CounterExhausted`] once [`MAX_COUNTER`] has been
    /// issued; the node must not continue writing after that.
    pub async fn next_counter(&self) -> Result<Counter> {
        let mut last = self.last_issued.lock().await;
        if *last >= MAX_COUNTER {
            return Err(Error::CounterExhausted(self.node_id.to_string()));
        }
        let next = *last + 1;

        self.backend.save_counter(next).await?;
        *last = next;
        Ok(next)
    }

    /// Issue the next version ID
    pub async fn next_version(&self) -> Result<VersionId> {
        let counter = self.next_counter().await?;
        Ok(VersionId::new(self.node_id.clone(), counter))
    }

    /// Raise the floor so the next issued counter is above `observed`
    ///
    /// Returns true if the floor moved. Never lowers the counter.
    pub async fn advance_to(&self, observed: Counter) -> Result<bool> {
        let mut last = self.last_issued.lock().await;
        if observed <= *last {
            return Ok(false);
        }
        if observed > MAX_COUNTER {
            return Err(Error::CounterExhausted(self.node_id.to_string()));
        }

        self.backend.save_counter(observed).await?;
        tracing::info!(
            "Counter for {} advanced from {} to {}",
            self.node_id,
            *last,
            observed
        );
        *last = observed;
        Ok(true)
    }

    /// Last counter handed out (0 if none)
    pub async fn last_issued(&self) -> Counter {
        *self.last_issued.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::collections::HashSet;

    async fn allocator(backend: Arc<MemoryBackend>) -> CounterAllocator {
        CounterAllocator::load(NodeId::from("node-1"), backend).await.unwrap()
    }

    #[tokio::test]
    async fn test_counters_strictly_increase() {
        let alloc = allocator(Arc::new(MemoryBackend::new())).await;
        let mut last = 0;
        for _ in 0..100 {
            let next = alloc.next_counter().await.unwrap();
            assert!(next > last, "counter went from {} to {}", last, next);
            last = next;
        }
        assert_eq!(alloc.last_issued().await, 100);
    }

    #[tokio::test]
    async fn test_concurrent_issuance_is_unique() {
        let alloc = Arc::new(allocator(Arc::new(MemoryBackend::new())).await);
        let mut handles = vec![];

        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..250 {
                    ids.push(alloc.next_counter().await.unwrap());
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(all.insert(id), "duplicate counter {}", id);
            }
        }
        assert_eq!(all.len(), 1000);
    }

    #[tokio::test]
    async fn test_resumes_after_restart() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let alloc = allocator(Arc::clone(&backend)).await;
            alloc.next_counter().await.unwrap();
            alloc.next_counter().await.unwrap();
        }

        let alloc = allocator(backend).await;
        assert_eq!(alloc.next_counter().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_advance_never_lowers() {
        let alloc = allocator(Arc::new(MemoryBackend::new())).await;
        assert!(alloc.advance_to(10).await.unwrap());
        assert!(!alloc.advance_to(4).await.unwrap());
        assert_eq!(alloc.next_counter().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save_counter(MAX_COUNTER - 1).await.unwrap();

        let alloc = allocator(backend).await;
        assert_eq!(alloc.next_counter().await.unwrap(), MAX_COUNTER);
        let err = alloc.next_counter().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(alloc.last_issued().await, MAX_COUNTER);
        assert!(alloc.advance_to(u64::MAX).await.unwrap_err().is_fatal());
    }

    #[test]
    fn test_version_total_order() {
        let a5 = VersionId::new(NodeId::from("a"), 5);
        let a7 = VersionId::new(NodeId::from("a"), 7);
        let b1 = VersionId::new(NodeId::from("b"), 1);

        assert!(a5 < a7);
        assert!(a7 < b1);
        assert_eq!(b1.to_string(), "b:1");
    }
}
