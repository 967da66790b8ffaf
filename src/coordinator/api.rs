//! Caller-facing operations on a running engine.
//!
//! - `write_through()` - persist to the store, then update the cache
//! - `read_through()` - cache-aside read that fills synchronously on a miss
//! - `stats()` / `queue_depth()` / `pressure()` - introspection
//! - `dead_letters()` - recently abandoned mutations

use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backpressure::BackpressureLevel;
use crate::change_event::DeadLetter;
use crate::fill::FillOutcome;
use crate::mapping::WriteMode;
use crate::observe::{SyncEvent, SyncEventKind, SyncOutcome};
use crate::storage::traits::StorageError;

use super::{EngineError, EngineState, EngineStats, SyncEngine};

impl SyncEngine {
    fn ensure_running(&self) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Running => Ok(()),
            other => Err(EngineError::NotRunning(other)),
        }
    }

    /// Persist `payload` (a JSON object) to the store, then write it to the
    /// cache.
    ///
    /// The store write is retried with the fill policy. The cache is only
    /// updated once the store has accepted the record, and the resulting
    /// change notification is not queued again.
    #[tracing::instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn write_through(&self, cache_key: &str, payload: &[u8]) -> Result<(), EngineError> {
        self.ensure_running()?;
        let lane = self
            .lane_for(cache_key)
            .ok_or_else(|| EngineError::Unmapped(cache_key.to_string()))?;
        let mapping = &lane.mapping;
        if mapping.write_mode == WriteMode::Disabled {
            return Err(StorageError::Rejected(format!(
                "writes are disabled for collection '{}'",
                mapping.collection
            ))
            .into());
        }
        let pk = mapping
            .primary_key(cache_key)
            .ok_or_else(|| EngineError::Unmapped(cache_key.to_string()))?;

        let record: Value = serde_json::from_slice(payload).map_err(StorageError::from)?;
        if !record.is_object() {
            return Err(StorageError::Serialization("payload is not a JSON object".into()).into());
        }

        let retry = self.config.fill_retry();
        let op_timeout = self.config.op_timeout();
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            let result = tokio::time::timeout(
                op_timeout,
                self.store
                    .upsert(&mapping.collection, &mapping.primary_key_field, pk, &record),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::Timeout {
                    operation: "upsert".to_string(),
                    timeout: op_timeout,
                })
            });

            match result {
                Ok(()) => break,
                Err(e) => {
                    self.observer.observe(
                        &SyncEvent::new(
                            SyncEventKind::Persist,
                            cache_key,
                            SyncOutcome::Failed,
                            attempt,
                            attempt_started.elapsed(),
                        )
                        .with_error(&e),
                    );
                    crate::metrics::record_persist(&mapping.collection, "SET", "retry");
                    if !e.is_retryable() || !retry.allows_another(attempt as usize) {
                        warn!(cache_key, attempt, error = %e, "Write-through failed, cache not updated");
                        return Err(e.into());
                    }
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
            }
        }

        self.echoes.remember(cache_key, payload);
        if let Err(e) = self.cache.set(cache_key, payload).await {
            self.echoes.forget(cache_key);
            warn!(cache_key, error = %e, "Store updated but cache write failed");
            return Err(e.into());
        }

        crate::metrics::record_persist(&mapping.collection, "SET", "success");
        crate::metrics::record_persist_latency(&mapping.collection, started.elapsed());
        self.observer.observe(&SyncEvent::new(
            SyncEventKind::Persist,
            cache_key,
            SyncOutcome::Persisted,
            attempt,
            started.elapsed(),
        ));
        debug!(cache_key, attempt, "Write-through complete");
        Ok(())
    }

    /// Cache-aside read.
    ///
    /// Returns the cached bytes, or fills the key from the store and returns
    /// what was cached. `Ok(None)` if the store has no record (or the
    /// mapping does not read through).
    pub async fn read_through(&self, cache_key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.ensure_running()?;
        let lane = self
            .lane_for(cache_key)
            .ok_or_else(|| EngineError::Unmapped(cache_key.to_string()))?;

        if let Some(bytes) = self.cache.get(cache_key).await? {
            return Ok(Some(bytes));
        }

        // The miss we just caused may already be filling in the background
        for _ in 0..2 {
            match lane.fill.fill(cache_key).await {
                (FillOutcome::Filled { .. }, bytes) => return Ok(bytes),
                (FillOutcome::Absent { .. } | FillOutcome::Ignored, _) => return Ok(None),
                (FillOutcome::Failed { attempts, error }, _) => {
                    return Err(EngineError::FillFailed {
                        cache_key: cache_key.to_string(),
                        attempts,
                        error,
                    })
                }
                (FillOutcome::Coalesced, _) => {
                    lane.fill.wait_for_fill(cache_key, self.fill_wait_bound()).await;
                    if let Some(bytes) = self.cache.get(cache_key).await? {
                        return Ok(Some(bytes));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Upper bound on a complete fill: every attempt timing out plus the
    /// backoff between them.
    fn fill_wait_bound(&self) -> Duration {
        let retry = self.config.fill_retry();
        let attempts = retry.max_retries.unwrap_or(1).max(1) as u32;
        let backoff: Duration = (1..attempts).map(|n| retry.delay_for_attempt(n)).sum();
        self.config.op_timeout() * attempts + backoff
    }

    /// Distinct pending keys over every write-behind queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.lanes.iter().map(|lane| lane.queue.depth()).sum()
    }

    /// Worst backpressure level over the write-behind queues.
    #[must_use]
    pub fn pressure(&self) -> BackpressureLevel {
        self.lanes
            .iter()
            .map(|lane| lane.queue.pressure())
            .max()
            .unwrap_or(BackpressureLevel::Normal)
    }

    /// Counters since startup, summed over every mapping.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            echoes_suppressed: self.router_stats.echoes_suppressed(),
            ..EngineStats::default()
        };
        for lane in self.lanes.iter() {
            let fill = lane.fill.stats();
            stats.filled += fill.filled;
            stats.absent += fill.absent;
            stats.fill_failures += fill.failed;
            stats.coalesced_fills += fill.coalesced;

            stats.persisted += lane.persist.persisted();
            stats.persist_failures += lane.persist.failures();
            stats.poisoned += lane.persist.poisoned();

            let queue = lane.queue.stats();
            stats.dead_lettered += queue.dead_lettered;
            stats.dropped += queue.dropped;
            stats.coalesced += queue.coalesced;
            stats.queue_depth += queue.depth;
        }
        stats
    }

    /// Most recent dead letters over every mapping, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, EngineError> {
        if let Some(wal) = &self.wal {
            return Ok(wal.dead_letters(limit).await?);
        }

        let mut letters = Vec::new();
        for lane in self.lanes.iter() {
            letters.extend(lane.queue.dead_letters(limit).await?);
        }
        letters.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        letters.truncate(limit);
        Ok(letters)
    }

    /// Change events routed to a lane since startup.
    #[must_use]
    pub fn events_routed(&self) -> u64 {
        self.router_stats.routed.load(Ordering::Relaxed)
    }
}
