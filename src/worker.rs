// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind worker: drains one queue partition into the document store.
//!
//! Each partition of each [`WriteBehindQueue`] has exactly one worker, so a
//! cache key is only ever persisted by one task. Per entry:
//!
//! ```text
//! SET  → parse JSON object → set primary-key field → upsert ─┐
//! DEL  → delete ─────────────────────────────────────────────┤
//!                                                            ▼
//!           ok ─► acknowledge          retryable ─► backoff, release
//!           bad payload ─► poison      rejected / exhausted ─► dead letter
//! ```

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::change_event::{ChangeOp, PendingEntry};
use crate::mapping::Mapping;
use crate::observe::{SyncEvent, SyncEventKind, SyncObserver, SyncOutcome};
use crate::queue::{QueueError, WriteBehindQueue};
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::{StorageError, StoreClient};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub op_timeout: Duration,
    pub retry: RetryConfig,
    /// Attempt count from which every further failure is logged at warn
    pub warn_after_attempts: u32,
    pub max_attempts: Option<u32>,
    pub max_age: Option<Duration>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            op_timeout: Duration::from_secs(5),
            retry: RetryConfig::write_behind(),
            warn_after_attempts: 5,
            max_attempts: None,
            max_age: None,
        }
    }
}

/// Persistence counters shared by every worker of a lane.
#[derive(Debug, Default)]
pub struct PersistStats {
    persisted: AtomicU64,
    failures: AtomicU64,
    poisoned: AtomicU64,
    dead_lettered: AtomicU64,
}

impl PersistStats {
    #[must_use]
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Failed attempts, including ones later retried successfully.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn poisoned(&self) -> u64 {
        self.poisoned.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

/// Why an entry cannot be persisted as-is.
enum Unpersistable {
    Poison(String),
    Unmapped,
}

pub struct SyncWorker {
    mapping: Arc<Mapping>,
    queue: Arc<WriteBehindQueue>,
    store: Arc<dyn StoreClient>,
    observer: Arc<dyn SyncObserver>,
    stats: Arc<PersistStats>,
    partition: usize,
    settings: WorkerSettings,
}

impl SyncWorker {
    pub fn new(
        mapping: Arc<Mapping>,
        queue: Arc<WriteBehindQueue>,
        store: Arc<dyn StoreClient>,
        observer: Arc<dyn SyncObserver>,
        stats: Arc<PersistStats>,
        partition: usize,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            mapping,
            queue,
            store,
            observer,
            stats,
            partition,
            settings,
        }
    }

    #[must_use]
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Drain the partition until shutdown is signalled and the partition is empty.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Some(ready) = self.queue.ready_signal(self.partition) else {
            error!(partition = self.partition, "Worker started for nonexistent partition");
            return;
        };
        debug!(collection = %self.mapping.collection, partition = self.partition, "Sync worker started");

        loop {
            let notified = ready.notified();
            let processed = self.process_batch().await;
            let draining = *shutdown.borrow();

            if draining && self.queue.partition_depth(self.partition) == 0 {
                break;
            }
            if processed > 0 {
                continue;
            }

            if draining {
                // Remaining entries are backing off; poll until they are ready
                tokio::time::sleep(self.settings.poll_interval).await;
                continue;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!(collection = %self.mapping.collection, partition = self.partition, "Engine dropped without shutdown, worker stopping");
                        return;
                    }
                }
            }
        }

        info!(collection = %self.mapping.collection, partition = self.partition, "Sync worker drained");
    }

    /// Take one batch from the partition and persist every entry in it.
    /// Returns the number of entries handled.
    pub async fn process_batch(&self) -> usize {
        let batch = self.queue.dequeue_batch(self.partition, self.settings.batch_size);
        if batch.is_empty() {
            return 0;
        }
        crate::metrics::record_batch_size(&self.mapping.collection, batch.len());

        let count = batch.len();
        for entry in batch {
            if let Err(e) = self.persist(entry).await {
                // Only the durable log can fail here; the entry stays in it
                error!(collection = %self.mapping.collection, error = %e, "Queue bookkeeping failed");
                crate::metrics::record_error("worker", "queue", "log");
            }
        }
        count
    }

    async fn persist(&self, entry: PendingEntry) -> Result<(), QueueError> {
        let started = Instant::now();
        let attempt = entry.attempt_count + 1;
        let op = entry.latest.op;

        let result = match self.apply(&entry).await {
            Ok(result) => result,
            Err(Unpersistable::Poison(reason)) => return self.poison(entry, reason, attempt, started).await,
            Err(Unpersistable::Unmapped) => {
                warn!(cache_key = %entry.cache_key, "Pending entry not under its mapping, dead-lettered");
                return self
                    .give_up(entry, "unmapped", "key does not match mapping prefix".into(), attempt, started)
                    .await;
            }
        };
        crate::metrics::record_persist_latency(&self.mapping.collection, started.elapsed());

        match result {
            Ok(()) => {
                let seq = entry.sequence();
                self.queue.acknowledge(&entry.cache_key, seq).await?;
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_persist(&self.mapping.collection, op.as_str(), "success");
                debug!(cache_key = %entry.cache_key, op = op.as_str(), sequence = seq, attempt, "Persisted to store");
                self.observer.observe(&SyncEvent::new(
                    SyncEventKind::Persist,
                    entry.cache_key,
                    SyncOutcome::Persisted,
                    attempt,
                    started.elapsed(),
                ));
                Ok(())
            }
            Err(e) if e.is_retryable() => self.retry_later(entry, e, started).await,
            Err(e) => {
                crate::metrics::record_persist(&self.mapping.collection, op.as_str(), "rejected");
                self.give_up(entry, "rejected", e.to_string(), attempt, started).await
            }
        }
    }

    /// Run the store call for the entry. The outer error means the entry
    /// can never be persisted; the inner result is the store's answer.
    async fn apply(&self, entry: &PendingEntry) -> Result<Result<(), StorageError>, Unpersistable> {
        let pk = self
            .mapping
            .primary_key(&entry.cache_key)
            .ok_or(Unpersistable::Unmapped)?;

        let collection = &self.mapping.collection;
        let field = &self.mapping.primary_key_field;
        let op_timeout = self.settings.op_timeout;

        let (operation, result) = match entry.latest.op {
            ChangeOp::Set => {
                let document = self.document(entry, pk)?;
                let result =
                    tokio::time::timeout(op_timeout, self.store.upsert(collection, field, pk, &document)).await;
                ("upsert", result)
            }
            ChangeOp::Delete => {
                let result = tokio::time::timeout(op_timeout, self.store.delete(collection, field, pk)).await;
                ("delete", result)
            }
        };

        Ok(result.unwrap_or_else(|_| {
            Err(StorageError::Timeout {
                operation: operation.to_string(),
                timeout: op_timeout,
            })
        }))
    }

    /// Parse the payload as a JSON object and stamp the primary key on it.
    fn document(&self, entry: &PendingEntry, pk: &str) -> Result<Value, Unpersistable> {
        let payload = entry
            .latest
            .payload
            .as_deref()
            .ok_or_else(|| Unpersistable::Poison("SET without payload".into()))?;
        let mut document: Value = serde_json::from_slice(payload)
            .map_err(|e| Unpersistable::Poison(StorageError::from(e).to_string()))?;
        let Some(obj) = document.as_object_mut() else {
            return Err(Unpersistable::Poison("payload is not a JSON object".into()));
        };
        obj.insert(
            self.mapping.primary_key_field.clone(),
            Value::String(pk.to_string()),
        );
        Ok(document)
    }

    async fn retry_later(&self, entry: PendingEntry, err: StorageError, started: Instant) -> Result<(), QueueError> {
        let seq = entry.sequence();
        let op = entry.latest.op;
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_persist(&self.mapping.collection, op.as_str(), "retry");
        crate::metrics::record_error("worker", op.as_str(), err.kind());

        let attempts = match self.queue.record_failure(&entry.cache_key, seq).await {
            Ok(Some(attempts)) => attempts,
            Ok(None) => {
                // Superseded while in flight; the newer event goes next
                self.queue.release(&entry.cache_key, seq, Duration::ZERO);
                return Ok(());
            }
            Err(e) => {
                // The lease must go back even when the log is unwritable
                let delay = self.settings.retry.delay_for_attempt(entry.attempt_count + 1);
                self.queue.release(&entry.cache_key, seq, delay);
                return Err(e);
            }
        };

        self.observer.observe(
            &SyncEvent::new(
                SyncEventKind::Persist,
                entry.cache_key.as_str(),
                SyncOutcome::Failed,
                attempts,
                started.elapsed(),
            )
            .with_error(&err),
        );

        if attempts >= self.settings.warn_after_attempts {
            warn!(
                cache_key = %entry.cache_key,
                collection = %self.mapping.collection,
                attempts,
                error = %err,
                "Store write still failing"
            );
        } else {
            debug!(cache_key = %entry.cache_key, attempts, error = %err, "Store write failed, will retry");
        }

        if let Some(max) = self.settings.max_attempts {
            if attempts >= max {
                let entry = PendingEntry { attempt_count: attempts, ..entry };
                return self.give_up(entry, "max_attempts", err.to_string(), attempts, started).await;
            }
        }
        if let Some(max_age) = self.settings.max_age {
            if entry.age_millis() >= max_age.as_millis() as i64 {
                let entry = PendingEntry { attempt_count: attempts, ..entry };
                return self.give_up(entry, "max_age", err.to_string(), attempts, started).await;
            }
        }

        let delay = self.settings.retry.delay_for_attempt(attempts);
        self.queue.release(&entry.cache_key, seq, delay);
        Ok(())
    }

    async fn poison(&self, entry: PendingEntry, reason: String, attempt: u32, started: Instant) -> Result<(), QueueError> {
        let cache_key = entry.cache_key.clone();
        error!(cache_key = %cache_key, collection = %self.mapping.collection, error = %reason, "Unparseable payload dropped");
        self.stats.poisoned.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_poison(&self.mapping.collection);

        self.queue.dead_letter(entry, "poison", Some(reason.clone())).await?;
        self.observer.observe(
            &SyncEvent::new(SyncEventKind::Persist, cache_key, SyncOutcome::Poisoned, attempt, started.elapsed())
                .with_error(reason),
        );
        Ok(())
    }

    async fn give_up(
        &self,
        entry: PendingEntry,
        reason: &str,
        error: String,
        attempt: u32,
        started: Instant,
    ) -> Result<(), QueueError> {
        let cache_key = entry.cache_key.clone();
        error!(
            cache_key = %cache_key,
            collection = %self.mapping.collection,
            reason,
            attempt,
            error = %error,
            "Giving up on store write, dead-lettered"
        );
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);

        self.queue.dead_letter(entry, reason, Some(error.clone())).await?;
        self.observer.observe(
            &SyncEvent::new(SyncEventKind::Persist, cache_key, SyncOutcome::DeadLettered, attempt, started.elapsed())
                .with_error(error),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::ChangeEvent;
    use crate::observe::RecordingObserver;
    use crate::queue::QueueConfig;
    use crate::resilience::wal::WriteAheadLog;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;

    struct Lane {
        queue: Arc<WriteBehindQueue>,
        store: Arc<InMemoryStore>,
        observer: Arc<RecordingObserver>,
        stats: Arc<PersistStats>,
    }

    fn lane() -> Lane {
        Lane {
            queue: Arc::new(WriteBehindQueue::new(
                "transactions",
                QueueConfig { partitions: 1, ..QueueConfig::default() },
                None,
            )),
            store: Arc::new(InMemoryStore::new()),
            observer: Arc::new(RecordingObserver::new()),
            stats: Arc::new(PersistStats::default()),
        }
    }

    fn worker(lane: &Lane, settings: WorkerSettings) -> SyncWorker {
        SyncWorker::new(
            Arc::new(Mapping::new("TransactionEntity:", "transactions", "transactionID")),
            lane.queue.clone(),
            lane.store.clone(),
            lane.observer.clone(),
            lane.stats.clone(),
            0,
            settings,
        )
    }

    fn fast_retry() -> WorkerSettings {
        WorkerSettings {
            retry: RetryConfig {
                max_retries: None,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                factor: 2.0,
            },
            ..WorkerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_set_upserts_with_primary_key() {
        let lane = lane();
        let w = worker(&lane, WorkerSettings::default());
        lane.queue
            .enqueue(ChangeEvent::set("TransactionEntity:t9", br#"{"amount":5}"#.to_vec(), 1))
            .await
            .unwrap();

        assert_eq!(w.process_batch().await, 1);
        assert_eq!(
            lane.store.record("transactions", "t9"),
            Some(json!({"amount": 5, "transactionID": "t9"}))
        );
        assert!(lane.queue.is_empty());
        assert_eq!(lane.observer.count(SyncEventKind::Persist, SyncOutcome::Persisted), 1);
        assert_eq!(lane.stats.persisted(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let lane = lane();
        lane.store.insert("transactions", "t9", json!({"transactionID": "t9"}));
        let w = worker(&lane, WorkerSettings::default());
        lane.queue.enqueue(ChangeEvent::delete("TransactionEntity:t9", 1)).await.unwrap();

        w.process_batch().await;
        assert_eq!(lane.store.record("transactions", "t9"), None);
    }

    #[tokio::test]
    async fn test_poison_payload_dead_lettered() {
        let lane = lane();
        let w = worker(&lane, WorkerSettings::default());
        lane.queue
            .enqueue(ChangeEvent::set("TransactionEntity:bad", b"not json".to_vec(), 1))
            .await
            .unwrap();
        lane.queue
            .enqueue(ChangeEvent::set("TransactionEntity:arr", b"[1,2]".to_vec(), 2))
            .await
            .unwrap();

        w.process_batch().await;
        assert!(lane.queue.is_empty());
        assert_eq!(lane.stats.poisoned(), 2);
        assert_eq!(lane.observer.count(SyncEventKind::Persist, SyncOutcome::Poisoned), 2);
        let letters = lane.queue.dead_letters(10).await.unwrap();
        assert!(letters.iter().all(|l| l.reason == "poison"));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_persisted() {
        let lane = lane();
        lane.store.fail_next_writes(2);
        let w = worker(&lane, fast_retry());
        lane.queue
            .enqueue(ChangeEvent::set("TransactionEntity:t1", br#"{"v":1}"#.to_vec(), 1))
            .await
            .unwrap();

        for _ in 0..3 {
            w.process_batch().await;
        }

        let events = lane.observer.events_for("TransactionEntity:t1");
        let outcomes: Vec<_> = events.iter().map(|e| (e.outcome, e.attempt_count)).collect();
        assert_eq!(
            outcomes,
            vec![(SyncOutcome::Failed, 1), (SyncOutcome::Failed, 2), (SyncOutcome::Persisted, 3)]
        );
        assert!(lane.queue.is_empty());
        assert_eq!(lane.stats.failures(), 2);
    }

    #[tokio::test]
    async fn test_max_attempts_dead_letters() {
        let lane = lane();
        lane.store.fail_next_writes(100);
        let w = worker(&lane, WorkerSettings { max_attempts: Some(2), ..fast_retry() });
        lane.queue
            .enqueue(ChangeEvent::set("TransactionEntity:t1", br#"{"v":1}"#.to_vec(), 1))
            .await
            .unwrap();

        w.process_batch().await;
        w.process_batch().await;

        assert!(lane.queue.is_empty());
        let letters = lane.queue.dead_letters(10).await.unwrap();
        assert_eq!(letters[0].reason, "max_attempts");
        assert_eq!(letters[0].entry.attempt_count, 2);
        assert_eq!(lane.observer.count(SyncEventKind::Persist, SyncOutcome::DeadLettered), 1);
    }

    #[tokio::test]
    async fn test_rejected_write_not_retried() {
        let lane = lane();
        lane.store.reject_writes(true);
        let w = worker(&lane, fast_retry());
        lane.queue
            .enqueue(ChangeEvent::set("TransactionEntity:t1", br#"{"v":1}"#.to_vec(), 1))
            .await
            .unwrap();

        w.process_batch().await;
        assert!(lane.queue.is_empty());
        assert_eq!(lane.queue.dead_letters(1).await.unwrap()[0].reason, "rejected");
        assert_eq!(lane.stats.dead_lettered(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_log_does_not_strand_entry() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WriteAheadLog::open(dir.path().join("worker.db")).await.unwrap());
        let lane = Lane {
            queue: Arc::new(WriteBehindQueue::new(
                "transactions",
                QueueConfig { partitions: 1, ..QueueConfig::default() },
                Some(wal.clone()),
            )),
            ..lane()
        };
        let w = worker(&lane, fast_retry());
        lane.queue
            .enqueue(ChangeEvent::set("TransactionEntity:t1", br#"{"v":1}"#.to_vec(), 1))
            .await
            .unwrap();

        wal.close().await;
        lane.store.fail_next_writes(1);

        // Failure bookkeeping cannot reach the log, the lease still comes back
        assert_eq!(w.process_batch().await, 1);
        assert_eq!(lane.queue.stats().in_flight, 0);

        assert_eq!(w.process_batch().await, 1);
        assert_eq!(
            lane.store.record("transactions", "t1"),
            Some(json!({"v": 1, "transactionID": "t1"}))
        );
        assert!(lane.queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_then_exits_on_shutdown() {
        let lane = lane();
        let w = worker(&lane, WorkerSettings::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(w.run(rx));

        for i in 0..10u64 {
            lane.queue
                .enqueue(ChangeEvent::set(format!("TransactionEntity:t{i}"), br#"{"v":1}"#.to_vec(), i + 1))
                .await
                .unwrap();
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert!(lane.queue.is_empty());
        assert_eq!(lane.store.len("transactions"), 10);
    }
}
