// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, per-key coalescing queue of pending write-behind mutations.
//!
//! One queue per mapping. Keys are hashed onto a fixed number of partitions
//! and each partition is drained by exactly one worker, so a key is never
//! persisted by two workers at once. Within a key only the latest event is
//! kept (last-write-wins) and a key that is in flight is not handed out
//! again until the worker settles it.
//!
//! With a [`WriteAheadLog`] attached, every entry is written to the log
//! before it becomes visible and removed only on acknowledgement.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use cache_sync::{ChangeEvent, EnqueueOutcome, QueueConfig, WriteBehindQueue};
//!
//! let queue = WriteBehindQueue::new("transactions", QueueConfig::default(), None);
//!
//! let first = queue.enqueue(ChangeEvent::set("TransactionEntity:t9", b"P".to_vec(), 1)).await.unwrap();
//! let second = queue.enqueue(ChangeEvent::set("TransactionEntity:t9", b"P2".to_vec(), 2)).await.unwrap();
//! assert_eq!(first, EnqueueOutcome::Queued);
//! assert_eq!(second, EnqueueOutcome::Coalesced);
//! assert_eq!(queue.depth(), 1);
//!
//! let partition = queue.partition_of("TransactionEntity:t9");
//! let batch = queue.dequeue_batch(partition, 10);
//! assert_eq!(batch[0].latest.payload.as_deref(), Some(b"P2".as_slice()));
//!
//! queue.acknowledge("TransactionEntity:t9", batch[0].sequence()).await.unwrap();
//! assert_eq!(queue.depth(), 0);
//! # }
//! ```

mod partition;

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::backpressure::BackpressureLevel;
use crate::change_event::{ChangeEvent, DeadLetter, PendingEntry};
use crate::resilience::wal::WriteAheadLog;
use crate::storage::traits::StorageError;
use partition::{Applied, Partition, Prepared, Settled};

/// Dead letters kept in memory when no write-ahead log is attached.
const DEAD_LETTER_RING: usize = 1000;

/// What happens when a new key arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Enqueue waits until a key is acknowledged.
    #[default]
    Block,
    /// The oldest pending key that is not in flight is dead-lettered
    /// (reason `overflow`) to make room.
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New pending key
    Queued,
    /// Replaced the pending entry for the key
    Coalesced,
    /// Sequence not newer than the pending entry; ignored
    Stale,
    /// Queued after evicting the oldest pending key
    DroppedOldest { evicted_key: String },
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Coalesced => "coalesced",
            Self::Stale => "stale",
            Self::DroppedOldest { .. } => "dropped_oldest",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue '{0}' is closed")]
    Closed(String),
    #[error("write-ahead log error: {0}")]
    Log(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub partitions: usize,
    pub max_depth: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            max_depth: 100_000,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

/// Counters since startup plus current depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub coalesced: u64,
    pub stale: u64,
    pub dropped: u64,
    pub acknowledged: u64,
    pub dead_lettered: u64,
}

pub struct WriteBehindQueue {
    name: String,
    config: QueueConfig,
    partitions: Vec<Mutex<Partition>>,
    /// Per-partition wakeup for its worker
    ready_signals: Vec<Notify>,
    /// Wakes enqueuers blocked on a full queue
    space: Notify,
    depth: AtomicUsize,
    order: AtomicU64,
    closed: AtomicBool,
    level: AtomicU8,
    wal: Option<Arc<WriteAheadLog>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,

    enqueued: AtomicU64,
    coalesced: AtomicU64,
    stale: AtomicU64,
    dropped: AtomicU64,
    acknowledged: AtomicU64,
    dead_lettered: AtomicU64,
}

impl WriteBehindQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig, wal: Option<Arc<WriteAheadLog>>) -> Self {
        let partitions = config.partitions.max(1);
        Self {
            name: name.into(),
            partitions: (0..partitions).map(|_| Mutex::new(Partition::default())).collect(),
            ready_signals: (0..partitions).map(|_| Notify::new()).collect(),
            config: QueueConfig { partitions, ..config },
            space: Notify::new(),
            depth: AtomicUsize::new(0),
            order: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            level: AtomicU8::new(BackpressureLevel::Normal as u8),
            wal,
            dead_letters: Mutex::new(VecDeque::new()),
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Stable key → partition assignment.
    #[must_use]
    pub fn partition_of(&self, cache_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        cache_key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Queue a change event, coalescing with any pending entry for the key.
    pub async fn enqueue(&self, event: ChangeEvent) -> Result<EnqueueOutcome, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.name.clone()));
        }

        let idx = self.partition_of(&event.cache_key);
        let prepared = self.partitions[idx].lock().prepare(event);

        let (mut entry, is_new) = match prepared {
            Prepared::Stale => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                return Ok(EnqueueOutcome::Stale);
            }
            Prepared::New(entry) => (entry, true),
            Prepared::Replace(entry) => (entry, false),
        };

        let mut reserved = is_new;
        let mut evicted_key = if is_new { self.reserve().await? } else { None };

        if let Some(wal) = &self.wal {
            if let Err(e) = wal.append(&entry).await {
                if reserved {
                    self.release_reservation();
                }
                return Err(e.into());
            }
        }

        let order = self.order.fetch_add(1, Ordering::Relaxed);
        let outcome = loop {
            let applied = self.partitions[idx].lock().commit(entry, order, reserved);
            break match applied {
                Applied::Vacated(returned) => {
                    // Slot was settled between prepare and commit; the key is new again
                    evicted_key = self.reserve().await?;
                    reserved = true;
                    entry = returned;
                    continue;
                }
                Applied::Inserted => {
                    self.enqueued.fetch_add(1, Ordering::Relaxed);
                    match evicted_key.take() {
                        Some(evicted_key) => EnqueueOutcome::DroppedOldest { evicted_key },
                        None => EnqueueOutcome::Queued,
                    }
                }
                Applied::Coalesced => {
                    if reserved {
                        self.release_reservation();
                    }
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    EnqueueOutcome::Coalesced
                }
                Applied::Stale => {
                    if reserved {
                        self.release_reservation();
                    }
                    self.stale.fetch_add(1, Ordering::Relaxed);
                    EnqueueOutcome::Stale
                }
            };
        };

        if outcome != EnqueueOutcome::Stale {
            self.ready_signals[idx].notify_one();
        }
        self.update_pressure();
        Ok(outcome)
    }

    /// Reserve depth for a new key, blocking or evicting per policy.
    async fn reserve(&self) -> Result<Option<String>, QueueError> {
        loop {
            let space = self.space.notified();

            if self.try_reserve() {
                return Ok(None);
            }
            if self.is_closed() {
                return Err(QueueError::Closed(self.name.clone()));
            }

            match self.config.overflow_policy {
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = self.evict_oldest().await? {
                        if self.try_reserve() {
                            return Ok(Some(evicted));
                        }
                        continue;
                    }
                    // Everything is in flight; wait like Block
                    space.await;
                }
                OverflowPolicy::Block => {
                    debug!(queue = %self.name, depth = self.depth(), "Queue full, enqueue blocked");
                    space.await;
                }
            }
        }
    }

    fn try_reserve(&self) -> bool {
        self.depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                (d < self.config.max_depth).then_some(d + 1)
            })
            .is_ok()
    }

    fn release_reservation(&self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
        self.space.notify_waiters();
    }

    async fn evict_oldest(&self) -> Result<Option<String>, QueueError> {
        let oldest = self
            .partitions
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                p.lock()
                    .oldest_evictable()
                    .map(|(order, key)| (order, i, key.to_string()))
            })
            .min();

        let Some((_, idx, key)) = oldest else { return Ok(None) };
        let Some(entry) = self.partitions[idx].lock().evict(&key) else {
            return Ok(None);
        };
        self.depth.fetch_sub(1, Ordering::AcqRel);
        self.dropped.fetch_add(1, Ordering::Relaxed);

        warn!(queue = %self.name, cache_key = %key, sequence = entry.sequence(), "Queue full, dropping oldest pending entry");
        self.store_dead_letter(DeadLetter::new(entry, "overflow", None)).await?;
        Ok(Some(key))
    }

    /// Hand out up to `max` entries from one partition, marking them in flight.
    pub fn dequeue_batch(&self, partition: usize, max: usize) -> Vec<PendingEntry> {
        match self.partitions.get(partition) {
            Some(p) => p.lock().take_ready(max, Instant::now()),
            None => Vec::new(),
        }
    }

    /// Notified whenever the partition may have new ready entries.
    #[must_use]
    pub fn ready_signal(&self, partition: usize) -> Option<&Notify> {
        self.ready_signals.get(partition)
    }

    /// Confirm `sequence` for `cache_key` reached the store.
    pub async fn acknowledge(&self, cache_key: &str, sequence: u64) -> Result<(), QueueError> {
        self.settle(cache_key, sequence);
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        if let Some(wal) = &self.wal {
            wal.acknowledge(cache_key, sequence).await?;
        }
        Ok(())
    }

    fn settle(&self, cache_key: &str, sequence: u64) {
        let idx = self.partition_of(cache_key);
        let settled = self.partitions[idx].lock().settle(cache_key, sequence);
        match settled {
            Settled::Removed => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                self.space.notify_waiters();
            }
            Settled::Requeued => self.ready_signals[idx].notify_one(),
            Settled::Unknown => {}
        }
        self.update_pressure();
    }

    /// Count a failed persistence attempt. Returns the new attempt count, or
    /// `None` when a newer event already replaced `sequence`.
    pub async fn record_failure(&self, cache_key: &str, sequence: u64) -> Result<Option<u32>, QueueError> {
        let idx = self.partition_of(cache_key);
        let attempts = self.partitions[idx].lock().record_failure(cache_key, sequence);
        if let (Some(wal), Some(n)) = (&self.wal, attempts) {
            wal.record_attempt(cache_key, sequence, n).await?;
        }
        Ok(attempts)
    }

    /// Give an in-flight entry back, to be handed out again after `delay`.
    pub fn release(&self, cache_key: &str, sequence: u64, delay: Duration) {
        let idx = self.partition_of(cache_key);
        let retry_at = (!delay.is_zero()).then(|| Instant::now() + delay);
        if self.partitions[idx].lock().release(cache_key, sequence, retry_at) {
            self.ready_signals[idx].notify_one();
            // Evictable again for a drop-oldest enqueue waiting on space
            self.space.notify_waiters();
        }
    }

    /// Give up on an entry: record it in the dead-letter log and settle it.
    pub async fn dead_letter(
        &self,
        entry: PendingEntry,
        reason: &str,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        self.settle(&entry.cache_key, entry.sequence());
        self.store_dead_letter(DeadLetter::new(entry, reason, error)).await
    }

    async fn store_dead_letter(&self, letter: DeadLetter) -> Result<(), QueueError> {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_dead_letter(&self.name, &letter.reason);
        match &self.wal {
            Some(wal) => wal.dead_letter(&letter).await?,
            None => {
                let mut ring = self.dead_letters.lock();
                if ring.len() >= DEAD_LETTER_RING {
                    ring.pop_front();
                }
                ring.push_back(letter);
            }
        }
        Ok(())
    }

    /// Put a recovered entry back without touching the log.
    pub fn restore(&self, entry: PendingEntry) -> bool {
        let idx = self.partition_of(&entry.cache_key);
        let order = self.order.fetch_add(1, Ordering::Relaxed);
        let mut partition = self.partitions[idx].lock();
        let existed = partition.contains(&entry.cache_key);
        let restored = partition.restore(entry, order);
        drop(partition);

        if restored {
            if !existed {
                self.depth.fetch_add(1, Ordering::AcqRel);
            }
            self.ready_signals[idx].notify_one();
        }
        restored
    }

    /// Recent dead letters, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        match &self.wal {
            Some(wal) => Ok(wal.dead_letters(limit).await?),
            None => Ok(self.dead_letters.lock().iter().rev().take(limit).cloned().collect()),
        }
    }

    /// Distinct pending keys (including in-flight ones).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn partition_depth(&self, partition: usize) -> usize {
        self.partitions.get(partition).map_or(0, |p| p.lock().len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    #[must_use]
    pub fn pressure(&self) -> BackpressureLevel {
        BackpressureLevel::from_depth(self.depth(), self.config.max_depth)
    }

    fn update_pressure(&self) {
        let depth = self.depth();
        crate::metrics::set_queue_depth(&self.name, depth);

        let level = self.pressure();
        let prev = self.level.swap(level as u8, Ordering::Relaxed);
        if prev != level as u8 {
            crate::metrics::set_backpressure_level(&self.name, level);
            if level > BackpressureLevel::Normal {
                warn!(queue = %self.name, depth, %level, "{}", level.description());
            } else {
                info!(queue = %self.name, depth, "Queue pressure back to normal");
            }
        }
    }

    /// Reject further enqueues and wake everything waiting on the queue.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.name, depth = self.depth(), "Queue closed");
        }
        self.space.notify_waiters();
        for signal in &self.ready_signals {
            signal.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth(),
            in_flight: self.partitions.iter().map(|p| p.lock().in_flight()).sum(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::ChangeOp;
    use tempfile::tempdir;

    fn queue(max_depth: usize, policy: OverflowPolicy) -> WriteBehindQueue {
        WriteBehindQueue::new(
            "test",
            QueueConfig { partitions: 2, max_depth, overflow_policy: policy },
            None,
        )
    }

    fn set(key: &str, payload: &str, seq: u64) -> ChangeEvent {
        ChangeEvent::set(key, payload.as_bytes().to_vec(), seq)
    }

    fn drain(q: &WriteBehindQueue) -> Vec<PendingEntry> {
        (0..q.partition_count()).flat_map(|p| q.dequeue_batch(p, 100)).collect()
    }

    #[tokio::test]
    async fn test_latest_event_wins() {
        let q = queue(100, OverflowPolicy::Block);
        q.enqueue(set("U:u1", "a", 1)).await.unwrap();
        q.enqueue(set("U:u1", "b", 2)).await.unwrap();
        q.enqueue(ChangeEvent::delete("U:u1", 3)).await.unwrap();
        assert_eq!(q.enqueue(set("U:u1", "late", 2)).await.unwrap(), EnqueueOutcome::Stale);

        let batch = drain(&q);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].latest.op, ChangeOp::Delete);

        let stats = q.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.in_flight, 1);
    }

    #[tokio::test]
    async fn test_key_always_same_partition() {
        let q = queue(100, OverflowPolicy::Block);
        for i in 0..50 {
            let key = format!("U:{}", i);
            assert_eq!(q.partition_of(&key), q.partition_of(&key));
            assert!(q.partition_of(&key) < q.partition_count());
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_first_enqueued() {
        let q = queue(2, OverflowPolicy::DropOldest);
        q.enqueue(set("U:1", "a", 1)).await.unwrap();
        q.enqueue(set("U:2", "b", 2)).await.unwrap();

        let outcome = q.enqueue(set("U:3", "c", 3)).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::DroppedOldest { evicted_key: "U:1".into() });
        assert_eq!(q.depth(), 2);

        let letters = q.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "overflow");
        assert_eq!(letters[0].entry.cache_key, "U:1");
        assert_eq!(q.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_coalescing_does_not_need_room() {
        let q = queue(1, OverflowPolicy::Block);
        q.enqueue(set("U:1", "a", 1)).await.unwrap();
        // Would block forever if it counted toward depth
        let outcome = q.enqueue(set("U:1", "b", 2)).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Coalesced);
        assert_eq!(q.pressure(), BackpressureLevel::Critical);
    }

    #[tokio::test]
    async fn test_block_waits_for_acknowledge() {
        let q = Arc::new(queue(1, OverflowPolicy::Block));
        q.enqueue(set("U:1", "a", 1)).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(set("U:2", "b", 2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let batch = drain(&q);
        q.acknowledge("U:1", batch[0].sequence()).await.unwrap();

        let outcome = producer.await.unwrap().unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued);
        assert_eq!(q.depth(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_and_unblocks() {
        let q = Arc::new(queue(1, OverflowPolicy::Block));
        q.enqueue(set("U:1", "a", 1)).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(set("U:2", "b", 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();

        assert!(matches!(producer.await.unwrap(), Err(QueueError::Closed(_))));
        assert!(matches!(q.enqueue(set("U:3", "c", 3)).await, Err(QueueError::Closed(_))));
    }

    #[tokio::test]
    async fn test_failure_then_release_redelivers() {
        let q = queue(100, OverflowPolicy::Block);
        q.enqueue(set("U:1", "a", 1)).await.unwrap();

        let entry = drain(&q).remove(0);
        assert_eq!(q.record_failure("U:1", entry.sequence()).await.unwrap(), Some(1));
        q.release("U:1", entry.sequence(), Duration::ZERO);

        let again = drain(&q);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_settles_entry() {
        let q = queue(100, OverflowPolicy::Block);
        q.enqueue(set("U:bad", "nope", 1)).await.unwrap();
        let entry = drain(&q).remove(0);

        q.dead_letter(entry, "poison", Some("expected value".into())).await.unwrap();
        assert!(q.is_empty());
        assert_eq!(q.dead_letters(5).await.unwrap()[0].reason, "poison");
    }

    #[tokio::test]
    async fn test_wal_mirrors_queue() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(WriteAheadLog::open(dir.path().join("q.db")).await.unwrap());
        let q = WriteBehindQueue::new("test", QueueConfig::default(), Some(wal.clone()));

        q.enqueue(set("U:1", "a", 1)).await.unwrap();
        q.enqueue(set("U:1", "b", 2)).await.unwrap();
        q.enqueue(set("U:2", "c", 3)).await.unwrap();
        assert_eq!(wal.count_pending().await.unwrap(), 2);

        let batch = drain(&q);
        for e in &batch {
            q.acknowledge(&e.cache_key, e.sequence()).await.unwrap();
        }
        assert_eq!(wal.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restore_counts_depth() {
        let q = queue(100, OverflowPolicy::Block);
        assert!(q.restore(PendingEntry::new(set("U:1", "a", 1))));
        assert!(!q.restore(PendingEntry::new(set("U:1", "old", 0))));
        assert_eq!(q.depth(), 1);
        assert_eq!(drain(&q).len(), 1);
    }
}
