// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-through: populate the cache from the document store on a miss.
//!
//! A [`MissFillHandler`] serves one mapping. On a miss it derives the
//! primary key from the cache key, looks the record up in the store and
//! writes the JSON-serialized record to the cache. Failures never escape:
//! the original reader just keeps seeing a miss.
//!
//! ```text
//! miss(UserEntity:u1) → lookup(users, userID = "u1") → set(UserEntity:u1, {"userID":"u1","name":"Ann"})
//! ```
//!
//! Fills for the same key are single-flight; fills across keys run in
//! parallel up to a shared permit limit.

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::mapping::Mapping;
use crate::observe::{SyncEvent, SyncEventKind, SyncObserver, SyncOutcome};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::{CacheClient, StorageError, StoreClient};

/// Treatment of the store's internal identifier before a record is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierPolicy {
    /// Remove the field
    #[default]
    Strip,
    /// Replace it with its string form (`{"$oid": "..."}` becomes the hex string)
    Stringify,
    /// Cache the record unchanged
    Preserve,
}

impl IdentifierPolicy {
    pub fn apply(&self, record: &mut Value, field: &str) {
        let Some(obj) = record.as_object_mut() else { return };
        match self {
            Self::Strip => {
                obj.remove(field);
            }
            Self::Stringify => {
                if let Some(id) = obj.get_mut(field) {
                    let text = match &*id {
                        Value::String(_) => return,
                        Value::Object(inner) => match inner.get("$oid") {
                            Some(Value::String(oid)) => oid.clone(),
                            _ => id.to_string(),
                        },
                        other => other.to_string(),
                    };
                    *id = Value::String(text);
                }
            }
            Self::Preserve => {}
        }
    }
}

/// Final result of one miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    /// Key not under this mapping, or read-through disabled
    Ignored,
    /// Another fill for the same key was already running
    Coalesced,
    Filled { attempts: u32 },
    /// No record in the store; cache untouched
    Absent { attempts: u32 },
    Failed { attempts: u32, error: String },
}

impl FillOutcome {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Filled { attempts } | Self::Absent { attempts } | Self::Failed { attempts, .. } => *attempts,
            Self::Ignored | Self::Coalesced => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Coalesced => "coalesced",
            Self::Filled { .. } => "filled",
            Self::Absent { .. } => "absent",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FillSettings {
    pub retry: RetryConfig,
    pub op_timeout: Duration,
    pub ttl: Option<Duration>,
    pub identifier_policy: IdentifierPolicy,
    pub identifier_field: String,
    pub circuit_breaker: bool,
}

impl Default for FillSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::fill(),
            op_timeout: Duration::from_secs(5),
            ttl: None,
            identifier_policy: IdentifierPolicy::Strip,
            identifier_field: "_id".to_string(),
            circuit_breaker: false,
        }
    }
}

/// Payloads recently written by fills, so the router can recognise the
/// cache's change notification for them and not write them back.
#[derive(Debug)]
pub struct FillEchoes {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    window: Duration,
}

impl FillEchoes {
    pub fn new(window: Duration) -> Self {
        Self { entries: DashMap::new(), window }
    }

    pub fn remember(&self, cache_key: &str, payload: &[u8]) {
        self.entries.insert(cache_key.to_string(), (payload.to_vec(), Instant::now()));
    }

    pub fn forget(&self, cache_key: &str) {
        self.entries.remove(cache_key);
    }

    /// True (and forgotten) if `payload` is what a fill just wrote to `cache_key`.
    pub fn take_if_echo(&self, cache_key: &str, payload: &[u8]) -> bool {
        let window = self.window;
        self.entries
            .remove_if(cache_key, |_, (written, at)| {
                at.elapsed() <= window && same_document(written, payload)
            })
            .is_some()
    }

    /// Drop entries older than the window.
    pub fn purge_expired(&self) {
        let window = self.window;
        self.entries.retain(|_, (_, at)| at.elapsed() <= window);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Byte-equal, or equal as JSON (the cache may re-encode JSON values).
fn same_document(a: &[u8], b: &[u8]) -> bool {
    if a == b {
        return true;
    }
    match (serde_json::from_slice::<Value>(a), serde_json::from_slice::<Value>(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillStats {
    pub filled: u64,
    pub absent: u64,
    pub failed: u64,
    pub coalesced: u64,
}

/// Removes the single-flight marker and wakes waiters, even if the fill
/// future is dropped mid-way.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, Arc<Notify>>,
    key: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some((_, notify)) = self.map.remove(self.key) {
            notify.notify_waiters();
        }
    }
}

pub struct MissFillHandler {
    mapping: Arc<Mapping>,
    cache: Arc<dyn CacheClient>,
    store: Arc<dyn StoreClient>,
    observer: Arc<dyn SyncObserver>,
    settings: FillSettings,
    permits: Arc<Semaphore>,
    echoes: Arc<FillEchoes>,
    circuit: Option<CircuitBreaker>,
    in_flight: DashMap<String, Arc<Notify>>,

    filled: AtomicU64,
    absent: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
}

impl MissFillHandler {
    pub fn new(
        mapping: Arc<Mapping>,
        cache: Arc<dyn CacheClient>,
        store: Arc<dyn StoreClient>,
        observer: Arc<dyn SyncObserver>,
        settings: FillSettings,
        permits: Arc<Semaphore>,
        echoes: Arc<FillEchoes>,
    ) -> Self {
        let circuit = settings
            .circuit_breaker
            .then(|| CircuitBreaker::new(format!("fill:{}", mapping.collection), CircuitConfig::fill()));
        Self {
            mapping,
            cache,
            store,
            observer,
            settings,
            permits,
            echoes,
            circuit,
            in_flight: DashMap::new(),
            filled: AtomicU64::new(0),
            absent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// Handle a cache miss. Never fails; the outcome says what happened.
    pub async fn on_miss(&self, cache_key: &str) -> FillOutcome {
        self.fill(cache_key).await.0
    }

    /// Fill and also return the bytes written to the cache.
    pub(crate) async fn fill(&self, cache_key: &str) -> (FillOutcome, Option<Vec<u8>>) {
        if !self.mapping.read_through {
            return (FillOutcome::Ignored, None);
        }
        let Some(pk) = self.mapping.primary_key(cache_key) else {
            debug!(cache_key, prefix = %self.mapping.key_prefix, "Miss not under mapping, ignored");
            return (FillOutcome::Ignored, None);
        };

        let notify = Arc::new(Notify::new());
        match self.in_flight.entry(cache_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_fill_coalesced(&self.mapping.collection);
                debug!(cache_key, "Fill already in progress, coalesced");
                return (FillOutcome::Coalesced, None);
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(notify);
            }
        }
        let _guard = InFlightGuard { map: &self.in_flight, key: cache_key };

        let Ok(_permit) = self.permits.acquire().await else {
            return (self.finish_failed(cache_key, 0, Instant::now(), "fill permits closed".into()), None);
        };

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            match self.lookup(pk).await {
                Ok(Some(record)) => {
                    return self.write_cache(cache_key, record, attempt, started).await;
                }
                Ok(None) => {
                    self.absent.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_fill(&self.mapping.collection, "absent", attempt);
                    crate::metrics::record_fill_latency(&self.mapping.collection, started.elapsed());
                    debug!(cache_key, attempt, "No record in store, cache left untouched");
                    self.observer.observe(&SyncEvent::new(
                        SyncEventKind::Fetch,
                        cache_key,
                        SyncOutcome::Absent,
                        attempt,
                        started.elapsed(),
                    ));
                    return (FillOutcome::Absent { attempts: attempt }, None);
                }
                Err(e) => {
                    self.observer.observe(
                        &SyncEvent::new(
                            SyncEventKind::Fetch,
                            cache_key,
                            SyncOutcome::Failed,
                            attempt,
                            attempt_started.elapsed(),
                        )
                        .with_error(&e),
                    );
                    crate::metrics::record_error("fill", "lookup", e.kind());

                    if !e.is_retryable() || !self.settings.retry.allows_another(attempt as usize) {
                        return (self.finish_failed(cache_key, attempt, started, e.to_string()), None);
                    }

                    let delay = self.settings.retry.delay_for_attempt(attempt);
                    debug!(cache_key, attempt, error = %e, ?delay, "Fill lookup failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Wait for an in-progress fill of `cache_key`, at most `timeout`.
    pub(crate) async fn wait_for_fill(&self, cache_key: &str, timeout: Duration) {
        let notify = match self.in_flight.get(cache_key) {
            Some(n) => n.clone(),
            None => return,
        };
        let notified = notify.notified();
        // Registered before the filler can remove the marker
        if !self.in_flight.contains_key(cache_key) {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    async fn lookup(&self, pk: &str) -> Result<Option<Value>, StorageError> {
        let op_timeout = self.settings.op_timeout;
        let store = &self.store;
        let mapping = &self.mapping;
        let call = || async move {
            tokio::time::timeout(
                op_timeout,
                store.lookup(&mapping.collection, &mapping.primary_key_field, pk),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::Timeout {
                    operation: "lookup".to_string(),
                    timeout: op_timeout,
                })
            })
        };

        match &self.circuit {
            None => call().await,
            Some(cb) => cb.call(call).await.map_err(|e| match e {
                CircuitError::Rejected => StorageError::Rejected(format!("circuit {} open", cb.name())),
                CircuitError::Inner(e) => e,
            }),
        }
    }

    async fn write_cache(
        &self,
        cache_key: &str,
        mut record: Value,
        attempt: u32,
        started: Instant,
    ) -> (FillOutcome, Option<Vec<u8>>) {
        self.settings
            .identifier_policy
            .apply(&mut record, &self.settings.identifier_field);

        let bytes = match serde_json::to_vec(&record) {
            Ok(b) => b,
            Err(e) => return (self.finish_failed(cache_key, attempt, started, e.to_string()), None),
        };

        // Remember before writing: the change notification can beat the reply
        self.echoes.remember(cache_key, &bytes);
        if let Err(e) = self.cache.set_with_ttl(cache_key, &bytes, self.settings.ttl).await {
            self.echoes.forget(cache_key);
            crate::metrics::record_error("fill", "cache_set", e.kind());
            return (self.finish_failed(cache_key, attempt, started, e.to_string()), None);
        }

        self.filled.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_fill(&self.mapping.collection, "filled", attempt);
        crate::metrics::record_fill_latency(&self.mapping.collection, started.elapsed());
        debug!(cache_key, attempt, bytes = bytes.len(), "Cache filled from store");
        self.observer.observe(&SyncEvent::new(
            SyncEventKind::Fetch,
            cache_key,
            SyncOutcome::Filled,
            attempt,
            started.elapsed(),
        ));
        (FillOutcome::Filled { attempts: attempt }, Some(bytes))
    }

    fn finish_failed(&self, cache_key: &str, attempts: u32, started: Instant, error: String) -> FillOutcome {
        self.failed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_fill(&self.mapping.collection, "failed", attempts);
        crate::metrics::record_fill_latency(&self.mapping.collection, started.elapsed());
        warn!(cache_key, attempts, error = %error, "Miss fill failed, key stays uncached");
        FillOutcome::Failed { attempts, error }
    }

    #[must_use]
    pub fn stats(&self) -> FillStats {
        FillStats {
            filled: self.filled.load(Ordering::Relaxed),
            absent: self.absent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}
