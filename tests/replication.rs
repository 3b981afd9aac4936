//! Replication Integration Tests
//!
//! In-process clusters wired together by a loopback transport that calls
//! straight into each node's peer message handler. Pushes can be dropped
//! and nodes marked unreachable to exercise the anti-entropy path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use slate::error::{Error, Result};
use slate::id::NodeId;
use slate::membership::{Neighbor, StaticNeighbors};
use slate::network::MessageHandler;
use slate::node::Node;
use slate::replication::{NeighborOutcome, PeerMessage, PeerTransport, ReplicationConfig};
use slate::store::{ClockSummary, MemoryBackend, Record, StorageBackend};

#[derive(Default)]
struct Loopback {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    drop_pushes: AtomicBool,
    unreachable: std::sync::Mutex<HashSet<String>>,
    pulls: AtomicUsize,
    /// (address, filter) of every pull
    pull_log: std::sync::Mutex<Vec<(String, Option<NodeId>)>>,
}

impl Loopback {
    async fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .await
            .insert(node.node_id().to_string(), Arc::clone(node));
    }

    fn set_unreachable(&self, address: &str, down: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if down {
            unreachable.insert(address.to_string());
        } else {
            unreachable.remove(address);
        }
    }

    async fn call(&self, address: &str, message: PeerMessage) -> Result<Option<PeerMessage>> {
        if self.unreachable.lock().unwrap().contains(address) {
            return Err(Error::ConnectionTimeout(address.to_string()));
        }
        let node = self.nodes.read().await.get(address).cloned().ok_or_else(|| {
            Error::ConnectionFailed {
                address: address.to_string(),
                reason: "no such node".into(),
            }
        })?;
        Ok(node.handle("loopback", message).await)
    }
}

#[async_trait]
impl PeerTransport for Loopback {
    async fn push(&self, neighbor: &Neighbor, record: &Record) -> Result<()> {
        if self.drop_pushes.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.call(&neighbor.address, PeerMessage::Push { record: record.clone() })
            .await
            .map(|_| ())
    }

    async fn fetch_clock(&self, neighbor: &Neighbor) -> Result<ClockSummary> {
        match self.call(&neighbor.address, PeerMessage::ClockRequest).await? {
            Some(PeerMessage::ClockResponse { summary, .. }) => Ok(summary),
            other => panic!("unexpected clock reply: {:?}", other),
        }
    }

    async fn pull(&self, neighbor: &Neighbor, since_origin: Option<&NodeId>) -> Result<Vec<Record>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.pull_log
            .lock()
            .unwrap()
            .push((neighbor.address.clone(), since_origin.cloned()));
        let request = PeerMessage::PullRequest {
            since_origin: since_origin.cloned(),
        };
        match self.call(&neighbor.address, request).await? {
            Some(PeerMessage::PullResponse { records }) => Ok(records),
            other => panic!("unexpected pull reply: {:?}", other),
        }
    }
}

fn config() -> ReplicationConfig {
    ReplicationConfig {
        anti_entropy_interval: Duration::from_secs(3600),
        anti_entropy_jitter: Duration::ZERO,
        push_queue_size: 64,
        recover_counter_on_start: false,
    }
}

async fn node_with_backend(
    net: &Arc<Loopback>,
    id: &str,
    neighbors: &[&str],
    backend: Arc<dyn StorageBackend>,
) -> Arc<Node> {
    let node_id = NodeId::from(id);
    let neighbors = neighbors.iter().map(|n| Neighbor::new(*n, *n)).collect();
    let node = Node::new(
        node_id.clone(),
        backend,
        Arc::new(StaticNeighbors::new(&node_id, neighbors)),
        Arc::clone(net) as Arc<dyn PeerTransport>,
        config(),
    )
    .await
    .unwrap();
    net.register(&node).await;
    node
}

async fn node(net: &Arc<Loopback>, id: &str, neighbors: &[&str]) -> Arc<Node> {
    node_with_backend(net, id, neighbors, Arc::new(MemoryBackend::new())).await
}

async fn value(node: &Node, key: &str) -> Option<Vec<u8>> {
    node.get(key).await.unwrap().map(|r| r.value)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_concurrent_writes_resolve_to_later_timestamp() {
    let net = Arc::new(Loopback::default());
    net.drop_pushes.store(true, Ordering::SeqCst);
    let a = node(&net, "a", &["b"]).await;
    let b = node(&net, "b", &["a"]).await;

    for i in 0..5 {
        a.put("x", format!("a{}", i).into_bytes()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    for i in 0..7 {
        b.put("x", format!("b{}", i).into_bytes()).await.unwrap();
    }

    a.run_anti_entropy().await.unwrap();
    b.run_anti_entropy().await.unwrap();

    let ra = a.get("x").await.unwrap().unwrap();
    let rb = b.get("x").await.unwrap().unwrap();
    assert_eq!(ra, rb);
    assert_eq!(ra.value, b"b6");
    assert_eq!(ra.clock.get(&NodeId::from("a")), 5);
    assert_eq!(ra.clock.get(&NodeId::from("b")), 7);
}

#[tokio::test]
async fn test_no_pull_when_neighbor_unchanged() {
    let net = Arc::new(Loopback::default());
    net.drop_pushes.store(true, Ordering::SeqCst);
    let a = node(&net, "a", &["b"]).await;
    let b = node(&net, "b", &["a"]).await;

    b.put("x", b"1".to_vec()).await.unwrap();
    let first = a.run_anti_entropy().await.unwrap();
    assert_eq!(first.stale, 1);
    let pulls = net.pulls.load(Ordering::SeqCst);

    let second = a.run_anti_entropy().await.unwrap();
    assert_eq!(second.contacted, 1);
    assert_eq!(second.stale, 0);
    assert_eq!(net.pulls.load(Ordering::SeqCst), pulls);

    // A write on b makes it stale again
    b.put("y", b"2".to_vec()).await.unwrap();
    let third = a.run_anti_entropy().await.unwrap();
    assert_eq!(third.stale, 1);
    assert_eq!(value(&a, "y").await, Some(b"2".to_vec()));
}

#[tokio::test]
async fn test_lost_push_repaired_by_anti_entropy() {
    let net = Arc::new(Loopback::default());
    let a = node(&net, "a", &["b"]).await;
    let b = node(&net, "b", &["a"]).await;

    net.drop_pushes.store(true, Ordering::SeqCst);
    a.put("x", b"lost".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(value(&b, "x").await, None);

    let report = b.run_anti_entropy().await.unwrap();
    assert_eq!(report.accepted, 1);
    assert_eq!(value(&b, "x").await, Some(b"lost".to_vec()));
    assert_eq!(a.clock().await, b.clock().await);
}

#[tokio::test]
async fn test_push_delivers_without_anti_entropy() {
    let net = Arc::new(Loopback::default());
    let a = node(&net, "a", &["b", "c"]).await;
    let b = node(&net, "b", &["a"]).await;
    let c = node(&net, "c", &["a"]).await;

    a.put("x", b"hello".to_vec()).await.unwrap();

    eventually(|| {
        let (b, c) = (Arc::clone(&b), Arc::clone(&c));
        async move {
            value(&b, "x").await.is_some() && value(&c, "x").await.is_some()
        }
    })
    .await;
    assert_eq!(value(&c, "x").await, Some(b"hello".to_vec()));
    assert_eq!(a.stats().await.push.dropped, 0);
}

#[tokio::test]
async fn test_line_topology_converges() {
    let net = Arc::new(Loopback::default());
    net.drop_pushes.store(true, Ordering::SeqCst);
    let a = node(&net, "a", &["b"]).await;
    let b = node(&net, "b", &["a", "c"]).await;
    let c = node(&net, "c", &["b"]).await;

    a.put("from-a", b"1".to_vec()).await.unwrap();
    c.put("from-c", b"2".to_vec()).await.unwrap();
    b.put("shared", b"b".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    c.put("shared", b"c".to_vec()).await.unwrap();

    // b gathers from both ends, then the ends gather from b
    b.run_anti_entropy().await.unwrap();
    a.run_anti_entropy().await.unwrap();
    c.run_anti_entropy().await.unwrap();

    for n in [&a, &b, &c] {
        assert_eq!(value(n, "from-a").await, Some(b"1".to_vec()));
        assert_eq!(value(n, "from-c").await, Some(b"2".to_vec()));
        assert_eq!(value(n, "shared").await, Some(b"c".to_vec()));
    }
    assert_eq!(a.clock().await, c.clock().await);
    assert_eq!(a.clock().await, b.clock().await);
}

#[tokio::test]
async fn test_out_of_order_push_repaired_transitively() {
    let net = Arc::new(Loopback::default());
    net.drop_pushes.store(true, Ordering::SeqCst);
    let a = node(&net, "a", &["b"]).await;
    let b = node(&net, "b", &["a", "c"]).await;
    let c = node(&net, "c", &["b"]).await;

    a.put("k1", b"one".to_vec()).await.unwrap();
    let k2 = a.put("k2", b"two".to_vec()).await.unwrap();
    // Only the second push reaches b
    b.merge(k2).await.unwrap();

    c.run_anti_entropy().await.unwrap();
    assert_eq!(value(&c, "k2").await, Some(b"two".to_vec()));
    assert_eq!(value(&c, "k1").await, None);

    // b repairs k1 from a; its clock already covers a:1
    let before = b.clock().await;
    b.run_anti_entropy().await.unwrap();
    assert_eq!(value(&b, "k1").await, Some(b"one".to_vec()));
    assert_eq!(b.clock().await, before);
    assert_eq!(b.summary().await.generation, 1);

    let report = c.run_anti_entropy().await.unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(value(&c, "k1").await, Some(b"one".to_vec()));
    assert_eq!(net.pull_log.lock().unwrap().last(), Some(&("b".to_string(), None)));

    for n in [&a, &b, &c] {
        assert_eq!(value(n, "k1").await, Some(b"one".to_vec()));
        assert_eq!(value(n, "k2").await, Some(b"two".to_vec()));
    }
    assert_eq!(c.run_anti_entropy().await.unwrap().stale, 0);
}

#[tokio::test]
async fn test_single_origin_pull_through_middle_node() {
    let net = Arc::new(Loopback::default());
    net.drop_pushes.store(true, Ordering::SeqCst);
    let a = node(&net, "a", &["b"]).await;
    let b = node(&net, "b", &["a", "c"]).await;
    let c = node(&net, "c", &["b"]).await;

    a.put("x", b"1".to_vec()).await.unwrap();
    c.put("y", b"2".to_vec()).await.unwrap();
    b.run_anti_entropy().await.unwrap();
    // b moved on two origins since c last looked
    c.run_anti_entropy().await.unwrap();
    assert_eq!(net.pull_log.lock().unwrap().last(), Some(&("b".to_string(), None)));
    assert_eq!(value(&c, "x").await, Some(b"1".to_vec()));

    a.put("x2", b"3".to_vec()).await.unwrap();
    b.run_anti_entropy().await.unwrap();
    let report = c.run_anti_entropy().await.unwrap();

    assert_eq!(
        net.pull_log.lock().unwrap().last(),
        Some(&("b".to_string(), Some(NodeId::from("a"))))
    );
    match &report.neighbors[0].outcome {
        NeighborOutcome::Pulled { since_origin, received, accepted, rejected, .. } => {
            assert_eq!(since_origin, &Some(NodeId::from("a")));
            // x and x2 carry a's history; y does not
            assert_eq!(*received, 2);
            assert_eq!(*accepted, 1);
            assert_eq!(*rejected, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(value(&c, "x2").await, Some(b"3".to_vec()));
    assert_eq!(c.clock().await.get(&NodeId::from("a")), 2);
}

#[tokio::test]
async fn test_unreachable_neighbor_does_not_block_round() {
    let net = Arc::new(Loopback::default());
    net.drop_pushes.store(true, Ordering::SeqCst);
    let a = node(&net, "a", &["b", "c"]).await;
    let _b = node(&net, "b", &["a"]).await;
    let c = node(&net, "c", &["a"]).await;

    c.put("x", b"from-c".to_vec()).await.unwrap();
    net.set_unreachable("b", true);

    let report = a.run_anti_entropy().await.unwrap();
    assert_eq!(report.unreachable, 1);
    assert_eq!(report.contacted, 1);
    assert_eq!(value(&a, "x").await, Some(b"from-c".to_vec()));

    net.set_unreachable("b", false);
    let report = a.run_anti_entropy().await.unwrap();
    assert_eq!(report.unreachable, 0);
    assert_eq!(report.contacted, 2);
}

#[tokio::test]
async fn test_counter_recovered_from_neighbors_after_data_loss() {
    let net = Arc::new(Loopback::default());
    net.drop_pushes.store(true, Ordering::SeqCst);
    let a = node(&net, "a", &["b"]).await;
    let b = node(&net, "b", &["a"]).await;

    for i in 0..3 {
        a.put("x", vec![i]).await.unwrap();
    }
    b.run_anti_entropy().await.unwrap();
    drop(a);

    // a comes back with an empty database
    let a = node(&net, "a", &["b"]).await;
    assert!(a.recover_counter().await.unwrap());

    let record = a.put("y", b"fresh".to_vec()).await.unwrap();
    assert_eq!(record.version.counter, 4);

    // The new write is not shadowed by the pre-loss history on b
    a.put("x", b"after".to_vec()).await.unwrap();
    b.run_anti_entropy().await.unwrap();
    assert_eq!(value(&b, "x").await, Some(b"after".to_vec()));
}
