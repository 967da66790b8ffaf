//! Cache event router.
//!
//! Reads the single cache event feed and dispatches each event to the lane
//! of the mapping whose prefix matches:
//!
//! - `Miss` → spawn a fill (if the mapping reads through)
//! - `Change` → enqueue for write-behind (if the mapping writes behind),
//!   unless it is the echo of a fill's own cache write
//!
//! Enqueue is awaited inline. With the `Block` overflow policy a full queue
//! stalls the router, which is the engine's backpressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::change_event::{CacheEvent, ChangeEvent, ChangeOp};
use crate::fill::FillEchoes;
use crate::mapping::{MappingTable, WriteMode};
use crate::observe::{SyncEvent, SyncEventKind, SyncObserver, SyncOutcome};
use crate::queue::EnqueueOutcome;
use crate::storage::traits::CacheEventStream;

use super::Lane;

/// How often expired echo markers are swept.
const ECHO_PURGE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub(crate) struct RouterStats {
    pub(crate) routed: AtomicU64,
    pub(crate) unrouted: AtomicU64,
    pub(crate) echoes_suppressed: AtomicU64,
}

impl RouterStats {
    #[must_use]
    pub(crate) fn echoes_suppressed(&self) -> u64 {
        self.echoes_suppressed.load(Ordering::Relaxed)
    }
}

pub(crate) struct Router {
    mappings: Arc<MappingTable>,
    lanes: Arc<Vec<Lane>>,
    echoes: Arc<FillEchoes>,
    observer: Arc<dyn SyncObserver>,
    stats: Arc<RouterStats>,
    /// Fills spawned by this router; aborted with it
    fills: JoinSet<()>,
}

impl Router {
    pub(crate) fn new(
        mappings: Arc<MappingTable>,
        lanes: Arc<Vec<Lane>>,
        echoes: Arc<FillEchoes>,
        observer: Arc<dyn SyncObserver>,
        stats: Arc<RouterStats>,
    ) -> Self {
        Self {
            mappings,
            lanes,
            echoes,
            observer,
            stats,
            fills: JoinSet::new(),
        }
    }

    /// Route events until the feed ends.
    pub(crate) async fn run(mut self, mut events: CacheEventStream) {
        let mut purge = tokio::time::interval(ECHO_PURGE_INTERVAL);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        error!("Cache event feed closed, misses and changes are no longer observed");
                        crate::metrics::record_error("router", "feed", "closed");
                        break;
                    }
                },
                Some(joined) = self.fills.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Fill task panicked");
                        }
                    }
                }
                _ = purge.tick() => self.echoes.purge_expired(),
            }
        }

        // Let running fills finish; abort only comes from shutdown
        while self.fills.join_next().await.is_some() {}
    }

    async fn dispatch(&mut self, event: CacheEvent) {
        let kind = match &event {
            CacheEvent::Miss { .. } => "miss",
            CacheEvent::Change(_) => "change",
        };
        let Some((idx, _)) = self.mappings.route(event.cache_key()) else {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_event(kind, false);
            trace!(cache_key = event.cache_key(), "Event matches no mapping, ignored");
            return;
        };
        let Some(lane) = self.lanes.get(idx) else {
            return;
        };
        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_event(kind, true);

        match event {
            CacheEvent::Miss { cache_key } => {
                if !lane.mapping.read_through {
                    trace!(cache_key = %cache_key, "Read-through disabled for mapping, miss ignored");
                    return;
                }
                let fill = lane.fill.clone();
                self.fills.spawn(async move {
                    fill.on_miss(&cache_key).await;
                });
            }
            CacheEvent::Change(change) => {
                if lane.mapping.write_mode != WriteMode::Behind {
                    trace!(cache_key = %change.cache_key, mode = ?lane.mapping.write_mode, "Change not queued for mapping");
                    return;
                }
                if self.is_fill_echo(&change) {
                    self.stats.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_echo_suppressed(&lane.mapping.collection);
                    debug!(cache_key = %change.cache_key, "Change is the echo of a fill, not written back");
                    return;
                }
                self.enqueue(lane, change).await;
            }
        }
    }

    fn is_fill_echo(&self, change: &ChangeEvent) -> bool {
        match (change.op, &change.payload) {
            (ChangeOp::Set, Some(payload)) => self.echoes.take_if_echo(&change.cache_key, payload),
            _ => false,
        }
    }

    async fn enqueue(&self, lane: &Lane, change: ChangeEvent) {
        let cache_key = change.cache_key.clone();
        match lane.queue.enqueue(change).await {
            Ok(outcome) => {
                crate::metrics::record_enqueue(&lane.mapping.collection, outcome.as_str());
                if let EnqueueOutcome::DroppedOldest { evicted_key } = outcome {
                    self.observer.observe(&SyncEvent::new(
                        SyncEventKind::Persist,
                        evicted_key,
                        SyncOutcome::Dropped,
                        0,
                        Duration::ZERO,
                    ));
                }
            }
            Err(e) => {
                warn!(cache_key = %cache_key, queue = lane.queue.name(), error = %e, "Change could not be queued");
                crate::metrics::record_error("router", "enqueue", "queue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill::{FillSettings, MissFillHandler};
    use crate::mapping::Mapping;
    use crate::observe::RecordingObserver;
    use crate::queue::{QueueConfig, WriteBehindQueue};
    use crate::storage::memory::{InMemoryCache, InMemoryStore};
    use crate::worker::PersistStats;
    use serde_json::json;
    use tokio::sync::{mpsc, Semaphore};

    struct Fixture {
        lanes: Arc<Vec<Lane>>,
        echoes: Arc<FillEchoes>,
        observer: Arc<RecordingObserver>,
        stats: Arc<RouterStats>,
        store: Arc<InMemoryStore>,
        cache: Arc<InMemoryCache>,
        router: Router,
    }

    fn fixture(mappings: Vec<Mapping>, queue: QueueConfig) -> Fixture {
        let table = Arc::new(MappingTable::new(mappings).unwrap());
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryStore::new());
        let observer = Arc::new(RecordingObserver::new());
        let echoes = Arc::new(FillEchoes::new(Duration::from_secs(5)));
        let permits = Arc::new(Semaphore::new(8));
        let lanes: Vec<Lane> = table
            .iter()
            .map(|m| Lane {
                mapping: m.clone(),
                fill: Arc::new(MissFillHandler::new(
                    m.clone(),
                    cache.clone(),
                    store.clone(),
                    observer.clone(),
                    FillSettings::default(),
                    permits.clone(),
                    echoes.clone(),
                )),
                queue: Arc::new(WriteBehindQueue::new(m.collection.clone(), queue.clone(), None)),
                persist: Arc::new(PersistStats::default()),
            })
            .collect();
        let lanes = Arc::new(lanes);
        let stats = Arc::new(RouterStats::default());
        let router = Router::new(table, lanes.clone(), echoes.clone(), observer.clone(), stats.clone());
        Fixture { lanes, echoes, observer, stats, store, cache, router }
    }

    fn users() -> Mapping {
        Mapping::new("UserEntity:", "users", "userID")
    }

    #[tokio::test]
    async fn test_change_routed_to_matching_lane() {
        let mut f = fixture(
            vec![users(), Mapping::new("TransactionEntity:", "transactions", "transactionID")],
            QueueConfig::default(),
        );

        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::set("TransactionEntity:t1", b"{}".to_vec(), 1)))
            .await;
        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::delete("Other:x", 2)))
            .await;

        assert_eq!(f.lanes[0].queue.depth(), 0);
        assert_eq!(f.lanes[1].queue.depth(), 1);
        assert_eq!(f.stats.routed.load(Ordering::Relaxed), 1);
        assert_eq!(f.stats.unrouted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_fill_echo_not_queued() {
        let mut f = fixture(vec![users()], QueueConfig::default());
        let payload = serde_json::to_vec(&json!({"userID": "u1"})).unwrap();
        f.echoes.remember("UserEntity:u1", &payload);

        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::set("UserEntity:u1", payload.clone(), 1)))
            .await;
        assert_eq!(f.lanes[0].queue.depth(), 0);
        assert_eq!(f.stats.echoes_suppressed(), 1);

        // The echo marker is consumed: the same write again is a real change
        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::set("UserEntity:u1", payload, 2)))
            .await;
        assert_eq!(f.lanes[0].queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_write_mode_gates_queueing() {
        let mut f = fixture(
            vec![
                users().with_write_mode(WriteMode::Through),
                Mapping::new("Audit:", "audit", "id").with_write_mode(WriteMode::Disabled),
            ],
            QueueConfig::default(),
        );

        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::set("UserEntity:u1", b"{}".to_vec(), 1)))
            .await;
        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::delete("Audit:a1", 2)))
            .await;
        assert!(f.lanes.iter().all(|l| l.queue.is_empty()));
    }

    #[tokio::test]
    async fn test_drop_oldest_observed() {
        let mut f = fixture(
            vec![users()],
            QueueConfig {
                partitions: 1,
                max_depth: 1,
                overflow_policy: crate::queue::OverflowPolicy::DropOldest,
            },
        );

        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::delete("UserEntity:u1", 1)))
            .await;
        f.router
            .dispatch(CacheEvent::Change(ChangeEvent::delete("UserEntity:u2", 2)))
            .await;

        assert_eq!(f.observer.count(SyncEventKind::Persist, SyncOutcome::Dropped), 1);
        assert_eq!(f.observer.events_for("UserEntity:u1").len(), 1);
    }

    #[tokio::test]
    async fn test_run_spawns_fills_and_exits_when_feed_closes() {
        let f = fixture(vec![users()], QueueConfig::default());
        f.store.insert("users", "u1", json!({"userID": "u1", "name": "Ann"}));

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(CacheEvent::Miss { cache_key: "UserEntity:u1".into() }).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), f.router.run(rx))
            .await
            .expect("router should exit once the feed closes");

        assert!(f.cache.raw("UserEntity:u1").is_some());
        assert_eq!(f.observer.count(SyncEventKind::Fetch, SyncOutcome::Filled), 1);
    }
}
