//! Gossip Pusher
//!
//! Best-effort propagation of fresh local writes. The write path only
//! enqueues; a background task fans each record out to the online
//! neighbors. Nothing is retried: a push that is dropped or fails is left
//! for anti-entropy to repair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::membership::NeighborList;
use crate::replication::PeerTransport;
use crate::store::Record;

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the push counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushStats {
    /// Records accepted into the queue
    pub enqueued: u64,
    /// Records dropped because the queue was full or closed
    pub dropped: u64,
    /// Individual neighbor sends that completed
    pub sent: u64,
    /// Individual neighbor sends that failed
    pub failed: u64,
}

/// Queue plus fan-out task for outbound pushes
pub struct GossipPusher {
    tx: mpsc::Sender<Record>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl GossipPusher {
    /// Start the fan-out task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        neighbors: Arc<dyn NeighborList>,
        transport: Arc<dyn PeerTransport>,
        queue_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(push_loop(rx, neighbors, transport, Arc::clone(&counters)));

        Self { tx, counters, task }
    }

    /// Queue a record for every online neighbor
    ///
    /// Never blocks the caller. Returns false if the record was dropped.
    pub fn enqueue(&self, record: Record) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Push queue full, dropping push of {}", record.key);
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Pusher stopped, dropping push of {}", record.key);
                false
            }
        }
    }

    pub fn stats(&self) -> PushStats {
        PushStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for GossipPusher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn push_loop(
    mut rx: mpsc::Receiver<Record>,
    neighbors: Arc<dyn NeighborList>,
    transport: Arc<dyn PeerTransport>,
    counters: Arc<Counters>,
) {
    while let Some(record) = rx.recv().await {
        let targets = match neighbors.online_neighbors().await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!("Cannot list neighbors, skipping push of {}: {}", record.key, e);
                continue;
            }
        };

        let record = Arc::new(record);
        for neighbor in targets {
            let transport = Arc::clone(&transport);
            let counters = Arc::clone(&counters);
            let record = Arc::clone(&record);

            // One task per neighbor so a slow peer never holds up the others
            tokio::spawn(async move {
                match transport.push(&neighbor, &record).await {
                    Ok(()) => {
                        counters.sent.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!("Pushed {} to {}", record.key, neighbor.id);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        if e.is_unreachable() {
                            tracing::debug!("Push of {} to {} failed: {}", record.key, neighbor.id, e);
                        } else {
                            tracing::warn!("Push of {} to {} failed: {}", record.key, neighbor.id, e);
                        }
                    }
                }
            });
        }
    }

    tracing::debug!("Push queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::error::{Error, Result};
    use crate::id::{NodeId, VersionId};
    use crate::membership::{Neighbor, StaticNeighbors};
    use crate::store::{wall_clock_now, ClockSummary};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        pushed: Mutex<Vec<(NodeId, String)>>,
    }

    #[async_trait]
    impl PeerTransport for Recording {
        async fn push(&self, neighbor: &Neighbor, record: &Record) -> Result<()> {
            if neighbor.id.as_str() == "down" {
                return Err(Error::ConnectionFailed {
                    address: neighbor.address.clone(),
                    reason: "refused".into(),
                });
            }
            self.pushed
                .lock()
                .await
                .push((neighbor.id.clone(), record.key.clone()));
            Ok(())
        }

        async fn fetch_clock(&self, _neighbor: &Neighbor) -> Result<ClockSummary> {
            Ok(ClockSummary::default())
        }

        async fn pull(&self, _neighbor: &Neighbor, _origin: Option<&NodeId>) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
    }

    fn record(key: &str) -> Record {
        let node = NodeId::from("a");
        let mut clock = VectorClock::new();
        clock.observe(&node, 1);
        Record {
            key: key.to_string(),
            value: b"v".to_vec(),
            version: VersionId::new(node, 1),
            clock,
            timestamp: wall_clock_now(),
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_push_reaches_online_neighbors_only() {
        let mut offline = Neighbor::new("c", "10.0.0.3:7654");
        offline.online = false;
        let neighbors = Arc::new(StaticNeighbors::new(
            &NodeId::from("a"),
            vec![
                Neighbor::new("b", "10.0.0.2:7654"),
                offline,
                Neighbor::new("down", "10.0.0.4:7654"),
            ],
        ));
        let transport = Arc::new(Recording::default());
        let pusher = GossipPusher::spawn(neighbors, transport.clone(), 16);

        assert!(pusher.enqueue(record("x")));
        wait_for(|| {
            let stats = pusher.stats();
            stats.sent + stats.failed == 2
        })
        .await;

        let pushed = transport.pushed.lock().await.clone();
        assert_eq!(pushed, vec![(NodeId::from("b"), "x".to_string())]);
        let stats = pusher.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        struct Stuck;

        #[async_trait]
        impl NeighborList for Stuck {
            async fn neighbors(&self) -> Result<Vec<Neighbor>> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }
        }

        let pusher = GossipPusher::spawn(Arc::new(Stuck), Arc::new(Recording::default()), 1);

        // The first record is taken by the stuck loop, the second fills the queue
        assert!(pusher.enqueue(record("k1")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pusher.enqueue(record("k2")));
        assert!(!pusher.enqueue(record("k3")));

        let stats = pusher.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }
}
