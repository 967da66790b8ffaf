//! In-process cache and store, for tests and demos.
//!
//! [`InMemoryCache`] behaves like a cache with keyspace notifications: a
//! `get` of a missing key publishes a miss, every `set`/`delete` publishes a
//! change with an increasing sequence number. [`InMemoryStore`] keeps one
//! map per collection and has knobs for injecting failures.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::traits::{CacheClient, CacheEventStream, StorageError, StoreClient};
use crate::change_event::{CacheEvent, ChangeEvent};

struct CachedValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CachedValue {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

pub struct InMemoryCache {
    data: DashMap<String, CachedValue>,
    sequence: AtomicU64,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<CacheEvent>)>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            sequence: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Read a value without publishing a miss.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.data
            .get(key)
            .filter(|v| v.is_live())
            .map(|v| v.bytes.clone())
    }

    /// Remaining time to live, if the key has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.data
            .get(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// End every subscriber's feed, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publish(&self, event: CacheEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(prefix, tx)| {
            if !event.cache_key().starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheClient for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self.raw(key);
        if value.is_none() {
            self.publish(CacheEvent::Miss { cache_key: key.to_string() });
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.set_with_ttl(key, value, None).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        // Sequence and write under the key's shard lock, so sequence order is write order
        let slot = self.data.entry(key.to_string());
        let seq = self.next_sequence();
        let written = slot.insert(CachedValue {
            bytes: value.to_vec(),
            expires_at: ttl.map(|t| Instant::now() + t),
        });
        self.publish(CacheEvent::Change(ChangeEvent::set(key, value.to_vec(), seq)));
        drop(written);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let Entry::Occupied(slot) = self.data.entry(key.to_string()) else {
            return Ok(());
        };
        let seq = self.next_sequence();
        slot.remove();
        self.publish(CacheEvent::Change(ChangeEvent::delete(key, seq)));
        Ok(())
    }

    async fn subscribe(&self, prefix_filter: &str) -> Result<CacheEventStream, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((prefix_filter.to_string(), tx));
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Consume one unit of an injected-failure budget.
fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

pub struct InMemoryStore {
    collections: DashMap<String, DashMap<String, Value>>,
    /// Every successful write per `collection/pk`, `None` for deletes
    history: DashMap<String, Vec<Option<Value>>>,
    lookup_failures: AtomicU32,
    write_failures: AtomicU32,
    reject_writes: AtomicBool,
    reachable: AtomicBool,
    slow_lookups: AtomicU32,
    lookup_delay: Mutex<Duration>,
    lookups: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            history: DashMap::new(),
            lookup_failures: AtomicU32::new(0),
            write_failures: AtomicU32::new(0),
            reject_writes: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            slow_lookups: AtomicU32::new(0),
            lookup_delay: Mutex::new(Duration::ZERO),
            lookups: AtomicU64::new(0),
        }
    }

    /// Seed a record directly, bypassing history.
    pub fn insert(&self, collection: &str, primary_key: &str, record: Value) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(primary_key.to_string(), record);
    }

    #[must_use]
    pub fn record(&self, collection: &str, primary_key: &str) -> Option<Value> {
        self.collections
            .get(collection)
            .and_then(|c| c.get(primary_key).map(|r| r.value().clone()))
    }

    /// Records in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Successful writes to one record, oldest first.
    #[must_use]
    pub fn history(&self, collection: &str, primary_key: &str) -> Vec<Option<Value>> {
        self.history
            .get(&format!("{collection}/{primary_key}"))
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Lookups served so far, including failed ones.
    #[must_use]
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// The next `n` lookups fail with a retryable backend error.
    pub fn fail_next_lookups(&self, n: u32) {
        self.lookup_failures.store(n, Ordering::Release);
    }

    /// The next `n` lookups take `delay` before answering.
    pub fn slow_next_lookups(&self, n: u32, delay: Duration) {
        *self.lookup_delay.lock() = delay;
        self.slow_lookups.store(n, Ordering::Release);
    }

    /// The next `n` upserts/deletes fail with a retryable backend error.
    pub fn fail_next_writes(&self, n: u32) {
        self.write_failures.store(n, Ordering::Release);
    }

    /// Make every write fail with a non-retryable rejection.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Release);
    }

    /// Whether `ping` succeeds.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    fn check_write(&self) -> Result<(), StorageError> {
        if self.reject_writes.load(Ordering::Acquire) {
            return Err(StorageError::Rejected("writes rejected".into()));
        }
        if take_one(&self.write_failures) {
            return Err(StorageError::Backend("injected write failure".into()));
        }
        Ok(())
    }

    fn log(&self, collection: &str, value: &str, record: Option<Value>) {
        self.history
            .entry(format!("{collection}/{value}"))
            .or_default()
            .push(record);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn lookup(&self, collection: &str, _field: &str, value: &str) -> Result<Option<Value>, StorageError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if take_one(&self.slow_lookups) {
            let delay = *self.lookup_delay.lock();
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.lookup_failures) {
            return Err(StorageError::Backend("injected lookup failure".into()));
        }
        Ok(self.record(collection, value))
    }

    async fn upsert(&self, collection: &str, _field: &str, value: &str, record: &Value) -> Result<(), StorageError> {
        self.check_write()?;
        self.insert(collection, value, record.clone());
        self.log(collection, value, Some(record.clone()));
        Ok(())
    }

    async fn delete(&self, collection: &str, _field: &str, value: &str) -> Result<(), StorageError> {
        self.check_write()?;
        if let Some(c) = self.collections.get(collection) {
            c.remove(value);
        }
        self.log(collection, value, None);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::Connection("store unreachable".into()))
        }
    }
}
