//! Anti-Entropy Reconciler
//!
//! Periodically asks every online neighbor for its clock summary and pulls
//! from the ones that have stored something since this node last fetched
//! from them. This is what repairs lost pushes and partitions.
//!
//! Per neighbor, one round is:
//!
//! 1. fetch the neighbor's clock and generation
//! 2. compare them against the summary cached at the last successful pull
//! 3. if either moved, pull (filtered to one origin when that origin is the
//!    only thing that moved)
//! 4. merge every pulled record
//! 5. cache the reported summary, but only if nothing failed along the way

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};

use crate::clock::CausalOrder;
use crate::error::{Error, Result};
use crate::id::{Counter, NodeId, MAX_COUNTER};
use crate::membership::{Neighbor, NeighborList};
use crate::replication::PeerTransport;
use crate::resolver::MergeOutcome;
use crate::store::{ClockSummary, RecordStore};

/// Idle pooled connections are released after this many intervals
const IDLE_INTERVALS: u32 = 3;

/// What to fetch from a neighbor this round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullPlan {
    UpToDate,
    /// Only this origin's entry moved; its records cover everything new
    Origin(NodeId),
    Everything,
}

impl PullPlan {
    /// Compare a neighbor's reported summary with the one cached for it
    ///
    /// A moved generation means a record was stored without raising the
    /// neighbor's clock, and such a record may carry no entry for the
    /// origin that advanced. Only a clean single-origin advance is filtered.
    pub fn between(cached: &ClockSummary, reported: &ClockSummary) -> Self {
        if reported == cached {
            return PullPlan::UpToDate;
        }
        if reported.generation != cached.generation
            || reported.clock.compare(&cached.clock) != CausalOrder::After
        {
            return PullPlan::Everything;
        }
        match reported.clock.advanced_origins(&cached.clock).as_slice() {
            [only] => PullPlan::Origin(only.clone()),
            _ => PullPlan::Everything,
        }
    }
}

/// Last summary fully pulled from each neighbor
#[derive(Default)]
pub struct NeighborClockCache {
    summaries: RwLock<HashMap<NodeId, ClockSummary>>,
}

impl NeighborClockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached summary for a neighbor; empty if never pulled
    pub async fn get(&self, neighbor: &NodeId) -> ClockSummary {
        self.summaries
            .read()
            .await
            .get(neighbor)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn update(&self, neighbor: NodeId, summary: ClockSummary) {
        self.summaries.write().await.insert(neighbor, summary);
    }

    pub async fn plan(&self, neighbor: &NodeId, reported: &ClockSummary) -> PullPlan {
        PullPlan::between(&self.get(neighbor).await, reported)
    }

    pub async fn snapshot(&self) -> HashMap<NodeId, ClockSummary> {
        self.summaries.read().await.clone()
    }
}

/// Contact history for one neighbor
#[derive(Debug, Clone, Default, Serialize)]
pub struct NeighborHealth {
    /// Last time an exchange with the neighbor completed
    pub last_contact: Option<DateTime<Utc>>,
    /// Rounds in a row that ended unreachable or failed
    pub consecutive_failures: u32,
}

/// What happened with one neighbor in one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NeighborOutcome {
    /// Nothing new since the last pull
    UpToDate,
    /// Records were pulled and every one of them was processed
    Pulled {
        since_origin: Option<NodeId>,
        received: usize,
        accepted: usize,
        rejected: usize,
        resolved_conflicts: usize,
        malformed: usize,
    },
    /// Timed out or refused; retried next round
    Unreachable { error: String },
    /// Answered, but the exchange could not be completed
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborReport {
    pub neighbor: NodeId,
    #[serde(flatten)]
    pub outcome: NeighborOutcome,
}

/// Summary of one anti-entropy round
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundReport {
    pub round: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Neighbors that answered the clock request
    pub contacted: usize,
    /// Neighbors that had something new
    pub stale: usize,
    pub unreachable: usize,
    pub failed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub resolved_conflicts: usize,
    pub malformed: usize,
    pub neighbors: Vec<NeighborReport>,
}

impl RoundReport {
    fn from_reports(round: u64, started_at: DateTime<Utc>, elapsed: Duration, reports: Vec<NeighborReport>) -> Self {
        let mut summary = Self {
            round,
            started_at: Some(started_at),
            duration_ms: elapsed.as_millis() as u64,
            ..Self::default()
        };

        for report in &reports {
            match &report.outcome {
                NeighborOutcome::UpToDate => summary.contacted += 1,
                NeighborOutcome::Pulled {
                    accepted,
                    rejected,
                    resolved_conflicts,
                    malformed,
                    ..
                } => {
                    summary.contacted += 1;
                    summary.stale += 1;
                    summary.accepted += accepted;
                    summary.rejected += rejected;
                    summary.resolved_conflicts += resolved_conflicts;
                    summary.malformed += malformed;
                }
                NeighborOutcome::Unreachable { .. } => summary.unreachable += 1,
                NeighborOutcome::Failed { .. } => summary.failed += 1,
            }
        }

        summary.neighbors = reports;
        summary
    }

    /// Records that changed the local store this round
    pub fn merged(&self) -> usize {
        self.accepted + self.resolved_conflicts
    }
}

/// Periodic pull-based repair against every online neighbor
pub struct AntiEntropyReconciler {
    store: Arc<RecordStore>,
    neighbors: Arc<dyn NeighborList>,
    transport: Arc<dyn PeerTransport>,
    cache: NeighborClockCache,
    health: RwLock<HashMap<NodeId, NeighborHealth>>,
    /// Keeps a manual sync from overlapping the periodic one
    round_lock: Mutex<()>,
    rounds: AtomicU64,
}

impl AntiEntropyReconciler {
    pub fn new(
        store: Arc<RecordStore>,
        neighbors: Arc<dyn NeighborList>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            store,
            neighbors,
            transport,
            cache: NeighborClockCache::new(),
            health: RwLock::new(HashMap::new()),
            round_lock: Mutex::new(()),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &NeighborClockCache {
        &self.cache
    }

    pub async fn health(&self) -> HashMap<NodeId, NeighborHealth> {
        self.health.read().await.clone()
    }

    /// Rounds completed so far
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Run one round against every online neighbor concurrently
    pub async fn run_round(&self) -> Result<RoundReport> {
        let _round = self.round_lock.lock().await;
        let started_at = Utc::now();
        let start = Instant::now();

        let neighbors = self.neighbors.online_neighbors().await?;
        let reports = join_all(neighbors.iter().map(|n| self.reconcile_neighbor(n))).await;

        for report in &reports {
            self.record_health(report).await;
        }

        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let report = RoundReport::from_reports(round, started_at, start.elapsed(), reports);

        if report.stale > 0 || report.failed > 0 {
            tracing::info!(
                "Anti-entropy round {}: {} contacted, {} stale, {} unreachable, {} failed, {} merged",
                report.round,
                report.contacted,
                report.stale,
                report.unreachable,
                report.failed,
                report.merged()
            );
        } else {
            tracing::debug!(
                "Anti-entropy round {}: {} contacted, {} unreachable, nothing new",
                report.round,
                report.contacted,
                report.unreachable
            );
        }

        Ok(report)
    }

    async fn reconcile_neighbor(&self, neighbor: &Neighbor) -> NeighborReport {
        let outcome = match self.try_reconcile(neighbor).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_unreachable() => {
                tracing::debug!("Neighbor {} unreachable: {}", neighbor.id, e);
                NeighborOutcome::Unreachable {
                    error: e.to_string(),
                }
            }
            Err(e) => {
                tracing::warn!("Anti-entropy with {} failed: {}", neighbor.id, e);
                NeighborOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        NeighborReport {
            neighbor: neighbor.id.clone(),
            outcome,
        }
    }

    async fn try_reconcile(&self, neighbor: &Neighbor) -> Result<NeighborOutcome> {
        let reported = self.transport.fetch_clock(neighbor).await?;

        let since_origin = match self.cache.plan(&neighbor.id, &reported).await {
            PullPlan::UpToDate => {
                tracing::trace!(
                    "Neighbor {} up to date at {} generation {}",
                    neighbor.id,
                    reported.clock,
                    reported.generation
                );
                return Ok(NeighborOutcome::UpToDate);
            }
            PullPlan::Origin(origin) => Some(origin),
            PullPlan::Everything => None,
        };
        tracing::debug!(
            "Neighbor {} moved to {} generation {}, pulling {}",
            neighbor.id,
            reported.clock,
            reported.generation,
            since_origin
                .as_ref()
                .map(|o| format!("records from {}", o))
                .unwrap_or_else(|| "everything".to_string())
        );

        let records = self.transport.pull(neighbor, since_origin.as_ref()).await?;
        let received = records.len();
        let (mut accepted, mut rejected, mut resolved_conflicts, mut malformed) = (0, 0, 0, 0);

        for record in records {
            match self.store.merge(record).await {
                Ok(MergeOutcome::Accepted) => accepted += 1,
                Ok(MergeOutcome::Rejected) => rejected += 1,
                Ok(MergeOutcome::ResolvedConflict { .. }) => resolved_conflicts += 1,
                Err(Error::MalformedRecord(e)) => {
                    tracing::warn!("Neighbor {} sent a malformed record: {}", neighbor.id, e);
                    malformed += 1;
                }
                // Leave the cache alone so the next round pulls again
                Err(e) => return Err(e),
            }
        }

        self.cache.update(neighbor.id.clone(), reported).await;

        Ok(NeighborOutcome::Pulled {
            since_origin,
            received,
            accepted,
            rejected,
            resolved_conflicts,
            malformed,
        })
    }

    async fn record_health(&self, report: &NeighborReport) {
        let mut health = self.health.write().await;
        let entry = health.entry(report.neighbor.clone()).or_default();
        match report.outcome {
            NeighborOutcome::Unreachable { .. } | NeighborOutcome::Failed { .. } => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            }
            NeighborOutcome::UpToDate | NeighborOutcome::Pulled { .. } => {
                entry.last_contact = Some(Utc::now());
                entry.consecutive_failures = 0;
            }
        }
    }

    /// Highest counter any reachable neighbor has recorded for this node
    ///
    /// Returns the counter and how many neighbors answered.
    pub async fn highest_observed_counter(&self) -> Result<(Counter, usize)> {
        let own = self.store.node_id().clone();
        let neighbors = self.neighbors.online_neighbors().await?;
        let summaries = join_all(neighbors.iter().map(|n| self.transport.fetch_clock(n))).await;

        let mut highest = 0;
        let mut answered = 0;
        for (neighbor, summary) in neighbors.iter().zip(summaries) {
            match summary {
                Ok(summary) => {
                    answered += 1;
                    let seen = summary.clock.get(&own);
                    if seen > MAX_COUNTER {
                        tracing::warn!("Ignoring counter {} for us from {}", seen, neighbor.id);
                        continue;
                    }
                    highest = highest.max(seen);
                }
                Err(e) => {
                    tracing::debug!("No counter from {}: {}", neighbor.id, e);
                }
            }
        }

        Ok((highest, answered))
    }

    /// Run rounds until `shutdown` flips to true
    ///
    /// Pooled connections idle for a few intervals are released after each
    /// round, and all of them on exit.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        jitter: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(
            "Anti-entropy started: every {:?} (+ up to {:?} jitter)",
            interval,
            jitter
        );

        loop {
            let delay = interval + random_jitter(jitter);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_round().await {
                tracing::warn!("Anti-entropy round failed: {}", e);
            }
            self.transport.prune_idle(interval.saturating_mul(IDLE_INTERVALS)).await;
        }

        self.transport.close().await;
        tracing::info!("Anti-entropy stopped");
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
