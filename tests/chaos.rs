//! Chaos Testing for the cache sync engine
//!
//! Failure scenarios driven through the public engine API:
//! 1. **FailingStore wrapper** - precise error injection at specific call counts
//! 2. **Outages** - store down for a while, then back
//! 3. **Crash + replay** - pending mutations survive a restart or a dropped engine via the log
//! 4. **Garbage data** - unparseable cache payloads
//! 5. **Ordering** - per-key order across partitioned workers with injected failures
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use cache_sync::{
    CacheClient, EngineState, InMemoryCache, InMemoryStore, Mapping, OverflowPolicy,
    RecordingObserver, StorageError, StoreClient, SyncEngine, SyncEngineConfig, SyncEventKind,
    SyncOutcome,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a store and fails writes on chosen call numbers, or all writes
/// while `down` is set.
pub struct FailingStore {
    inner: Arc<InMemoryStore>,
    write_calls: AtomicU64,
    /// Fail on these write call numbers (1-indexed)
    fail_on_writes: Vec<u64>,
    down: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<InMemoryStore>, fail_on_writes: Vec<u64>) -> Self {
        Self {
            inner,
            write_calls: AtomicU64::new(0),
            fail_on_writes,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("store down".into()));
        }
        if self.fail_on_writes.contains(&call) {
            return Err(StorageError::Backend(format!("injected failure on write {call}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreClient for FailingStore {
    async fn lookup(&self, collection: &str, field: &str, value: &str) -> Result<Option<Value>, StorageError> {
        self.inner.lookup(collection, field, value).await
    }

    async fn upsert(&self, collection: &str, field: &str, value: &str, record: &Value) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.upsert(collection, field, value, record).await
    }

    async fn delete(&self, collection: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.delete(collection, field, value).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> SyncEngineConfig {
    SyncEngineConfig {
        mappings: vec![
            Mapping::new("UserEntity:", "users", "userID"),
            Mapping::new("TransactionEntity:", "transactions", "transactionID"),
        ],
        poll_interval_ms: 5,
        retry_initial_ms: 2,
        retry_max_ms: 20,
        fill_retry_initial_ms: 1,
        fill_retry_max_ms: 5,
        op_timeout_ms: 500,
        shutdown_grace_ms: 2_000,
        wal_path: None,
        ..Default::default()
    }
}

async fn start(
    config: SyncEngineConfig,
    cache: Arc<InMemoryCache>,
    store: Arc<dyn StoreClient>,
) -> (SyncEngine, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::new());
    let mut engine = SyncEngine::new(config, cache, store)
        .expect("valid config")
        .with_observer(observer.clone());
    engine.start().await.expect("engine starts");
    (engine, observer)
}

/// Poll `check` until it holds or `timeout` passes.
async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn doc(v: Value) -> Vec<u8> {
    serde_json::to_vec(&v).unwrap()
}

// =============================================================================
// Read-through chaos
// =============================================================================

#[tokio::test]
async fn chaos_lookup_times_out_then_recovers() {
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    store.insert("users", "u1", json!({"userID": "u1", "name": "Ann"}));
    store.slow_next_lookups(3, Duration::from_millis(500));

    let config = SyncEngineConfig { op_timeout_ms: 50, ..fast_config() };
    let (engine, observer) = start(config, cache.clone(), store.clone()).await;

    assert!(cache.get("UserEntity:u1").await.unwrap().is_none());
    assert!(eventually(Duration::from_secs(5), || cache.raw("UserEntity:u1").is_some()).await);

    let events = observer.events_for("UserEntity:u1");
    let failed: Vec<_> = events.iter().filter(|e| e.outcome == SyncOutcome::Failed).collect();
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|e| e.error.as_deref().unwrap_or("").contains("timed out")));

    let filled = events
        .iter()
        .find(|e| e.outcome == SyncOutcome::Filled)
        .expect("fill eventually succeeds");
    assert_eq!(filled.kind, SyncEventKind::Fetch);
    assert_eq!(filled.attempt_count, 4);

    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_lookup_exhausts_retries_leaves_key_uncached() {
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    store.insert("users", "u1", json!({"userID": "u1"}));
    store.fail_next_lookups(50);

    let (engine, observer) = start(fast_config(), cache.clone(), store.clone()).await;

    cache.get("UserEntity:u1").await.unwrap();
    assert!(eventually(Duration::from_secs(5), || {
        observer.count(SyncEventKind::Fetch, SyncOutcome::Failed) >= 5
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(cache.raw("UserEntity:u1").is_none());
    assert_eq!(engine.stats().fill_failures, 1);
    assert_eq!(engine.state(), EngineState::Running);
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_concurrent_misses_single_lookup() {
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    store.insert("users", "hot", json!({"userID": "hot"}));
    store.slow_next_lookups(1, Duration::from_millis(100));

    let (engine, _observer) = start(fast_config(), cache.clone(), store.clone()).await;

    for _ in 0..20 {
        cache.get("UserEntity:hot").await.unwrap();
    }
    assert!(eventually(Duration::from_secs(5), || cache.raw("UserEntity:hot").is_some()).await);

    assert_eq!(store.lookup_count(), 1);
    assert!(engine.stats().coalesced_fills >= 1);
    engine.shutdown().await;
}

// =============================================================================
// Write-behind chaos
// =============================================================================

#[tokio::test]
async fn chaos_injected_write_failures_are_retried() {
    let cache = Arc::new(InMemoryCache::new());
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FailingStore::new(inner.clone(), vec![1, 2, 3]));

    let (engine, observer) = start(fast_config(), cache.clone(), store.clone()).await;

    cache
        .set("TransactionEntity:t1", &doc(json!({"transactionID": "t1", "amount": 10})))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(5), || inner.record("transactions", "t1").is_some()).await);
    assert_eq!(store.write_calls(), 4);

    let attempts: Vec<_> = observer
        .events_for("TransactionEntity:t1")
        .iter()
        .map(|e| (e.outcome, e.attempt_count))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (SyncOutcome::Failed, 1),
            (SyncOutcome::Failed, 2),
            (SyncOutcome::Failed, 3),
            (SyncOutcome::Persisted, 4),
        ]
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_outage_coalesces_to_latest_state() {
    let cache = Arc::new(InMemoryCache::new());
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FailingStore::new(inner.clone(), vec![]));
    store.set_down(true);

    let (engine, _observer) = start(fast_config(), cache.clone(), store.clone()).await;

    for amount in 1..=10 {
        cache
            .set("TransactionEntity:t1", &doc(json!({"transactionID": "t1", "amount": amount})))
            .await
            .unwrap();
    }
    cache.set("UserEntity:u1", &doc(json!({"userID": "u1"}))).await.unwrap();
    cache.delete("UserEntity:u1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.queue_depth(), 2);
    assert!(inner.history("transactions", "t1").is_empty());

    store.set_down(false);
    assert!(eventually(Duration::from_secs(5), || engine.queue_depth() == 0).await);

    // Only the latest state reaches the store
    assert_eq!(
        inner.history("transactions", "t1"),
        vec![Some(json!({"transactionID": "t1", "amount": 10}))]
    );
    assert_eq!(inner.history("users", "u1"), vec![None]);
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_second_payload_wins() {
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    let (engine, _observer) = start(fast_config(), cache.clone(), store.clone()).await;

    cache.set("TransactionEntity:t9", &doc(json!({"amount": 1, "note": "P"}))).await.unwrap();
    cache.set("TransactionEntity:t9", &doc(json!({"amount": 2, "note": "P2"}))).await.unwrap();

    let expected = json!({"amount": 2, "note": "P2", "transactionID": "t9"});
    assert!(eventually(Duration::from_secs(5), || {
        store.record("transactions", "t9").as_ref() == Some(&expected)
    })
    .await);
    assert!(eventually(Duration::from_secs(5), || engine.queue_depth() == 0).await);
    assert_eq!(store.history("transactions", "t9").last(), Some(&Some(expected)));
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_per_key_order_holds_across_workers() {
    let cache = Arc::new(InMemoryCache::new());
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FailingStore::new(inner.clone(), (1..200).step_by(7).collect()));
    let config = SyncEngineConfig { queue_partitions: 4, batch_size: 3, ..fast_config() };
    let (engine, _observer) = start(config, cache.clone(), store.clone()).await;

    for version in 1..=10 {
        for key in 0..20 {
            cache
                .set(
                    &format!("TransactionEntity:t{key}"),
                    &doc(json!({"version": version})),
                )
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;
    }

    assert!(eventually(Duration::from_secs(10), || engine.queue_depth() == 0).await);

    for key in 0..20 {
        let versions: Vec<i64> = inner
            .history("transactions", &format!("t{key}"))
            .iter()
            .map(|doc| doc.as_ref().and_then(|d| d["version"].as_i64()).unwrap_or(-1))
            .collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]), "t{key} out of order: {versions:?}");
        assert_eq!(versions.last(), Some(&10), "t{key} did not reach latest");
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_garbage_payload_is_poisoned_not_retried() {
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    let (engine, observer) = start(fast_config(), cache.clone(), store.clone()).await;

    cache.set("UserEntity:bad", b"\x00\xffnot json").await.unwrap();
    cache.set("UserEntity:good", &doc(json!({"userID": "good"}))).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || store.record("users", "good").is_some()).await);
    assert!(eventually(Duration::from_secs(5), || engine.stats().poisoned == 1).await);

    assert_eq!(observer.count(SyncEventKind::Persist, SyncOutcome::Poisoned), 1);
    assert!(store.record("users", "bad").is_none());
    let letters = engine.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, "poison");
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_rejected_write_dead_lettered() {
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    store.reject_writes(true);
    let (engine, observer) = start(fast_config(), cache.clone(), store.clone()).await;

    cache.set("UserEntity:u1", &doc(json!({"userID": "u1"}))).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || {
        observer.count(SyncEventKind::Persist, SyncOutcome::DeadLettered) == 1
    })
    .await);
    assert_eq!(engine.queue_depth(), 0);
    assert_eq!(engine.dead_letters(10).await.unwrap()[0].reason, "rejected");
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_overflow_drops_oldest_while_store_down() {
    let cache = Arc::new(InMemoryCache::new());
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(FailingStore::new(inner.clone(), vec![]));
    store.set_down(true);

    let config = SyncEngineConfig {
        queue_max_depth: 3,
        queue_partitions: 1,
        overflow_policy: OverflowPolicy::DropOldest,
        ..fast_config()
    };
    let (engine, observer) = start(config, cache.clone(), store.clone()).await;

    for i in 0..5 {
        cache
            .set(&format!("UserEntity:u{i}"), &doc(json!({"userID": format!("u{i}")})))
            .await
            .unwrap();
    }

    assert!(eventually(Duration::from_secs(5), || {
        observer.count(SyncEventKind::Persist, SyncOutcome::Dropped) == 2
    })
    .await);
    assert!(engine.queue_depth() <= 3);
    assert_eq!(engine.stats().dropped, 2);

    store.set_down(false);
    assert!(eventually(Duration::from_secs(5), || engine.queue_depth() == 0).await);
    assert_eq!(inner.len("users"), 3);
    assert!(inner.record("users", "u4").is_some());
    engine.shutdown().await;
}

// =============================================================================
// Crash + replay
// =============================================================================

#[tokio::test]
async fn chaos_pending_mutations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("queue.db").display().to_string();
    let config = SyncEngineConfig {
        wal_path: Some(wal_path),
        shutdown_grace_ms: 50,
        ..fast_config()
    };

    // First run: store down for the whole lifetime
    let inner = Arc::new(InMemoryStore::new());
    let down = Arc::new(FailingStore::new(inner.clone(), vec![]));
    down.set_down(true);
    let cache = Arc::new(InMemoryCache::new());
    let (engine, _) = start(config.clone(), cache.clone(), down.clone()).await;

    cache
        .set("TransactionEntity:t1", &doc(json!({"transactionID": "t1", "amount": 5})))
        .await
        .unwrap();
    cache.set("UserEntity:u1", &doc(json!({"userID": "u1"}))).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || engine.queue_depth() == 2).await);
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(inner.record("transactions", "t1").is_none());

    // Second run: healthy store, same log
    let (engine, observer) = start(config, Arc::new(InMemoryCache::new()), inner.clone()).await;
    assert!(eventually(Duration::from_secs(5), || {
        inner.record("transactions", "t1").is_some() && inner.record("users", "u1").is_some()
    })
    .await);
    assert_eq!(inner.record("transactions", "t1").unwrap()["amount"], 5);
    assert_eq!(observer.count(SyncEventKind::Persist, SyncOutcome::Persisted), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_unacknowledged_mutations_survive_crash() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncEngineConfig {
        wal_path: Some(dir.path().join("crash.db").display().to_string()),
        ..fast_config()
    };

    let inner = Arc::new(InMemoryStore::new());
    let down = Arc::new(FailingStore::new(inner.clone(), vec![]));
    down.set_down(true);
    let cache = Arc::new(InMemoryCache::new());
    let (engine, observer) = start(config.clone(), cache.clone(), down.clone()).await;

    cache
        .set("TransactionEntity:t7", &doc(json!({"transactionID": "t7", "amount": 70})))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(5), || {
        observer.count(SyncEventKind::Persist, SyncOutcome::Failed) >= 1
    })
    .await);

    // No shutdown: no drain, no checkpoint, workers see the engine vanish
    drop(engine);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(inner.record("transactions", "t7").is_none());

    let (engine, _) = start(config, Arc::new(InMemoryCache::new()), inner.clone()).await;
    assert!(eventually(Duration::from_secs(5), || inner.record("transactions", "t7").is_some()).await);
    assert_eq!(inner.record("transactions", "t7").unwrap()["amount"], 70);
    assert!(eventually(Duration::from_secs(5), || engine.queue_depth() == 0).await);
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_event_feed_disconnect_keeps_engine_stoppable() {
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());
    let (engine, _) = start(fast_config(), cache.clone(), store.clone()).await;

    cache.disconnect_subscribers();
    cache.set("UserEntity:u1", &doc(json!({"userID": "u1"}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(store.record("users", "u1").is_none());
    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .expect("shutdown completes without a feed");
    assert_eq!(engine.state(), EngineState::Stopped);
}
