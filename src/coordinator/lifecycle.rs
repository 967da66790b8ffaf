//! Engine lifecycle management: start and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::change_event::DeadLetter;
use crate::fill::MissFillHandler;
use crate::queue::WriteBehindQueue;
use crate::resilience::wal::WriteAheadLog;
use crate::storage::traits::StorageError;
use crate::worker::{PersistStats, SyncWorker};

use super::router::Router;
use super::{EngineError, EngineState, Lane, SyncEngine};

impl SyncEngine {
    /// Start the engine.
    ///
    /// Startup flow:
    /// 1. Ping store and cache once each (fail fast, no retry)
    /// 2. Open the write-ahead log, if configured
    /// 3. Build one lane per mapping and restore pending rows into the queues
    /// 4. Spawn one worker per queue partition
    /// 5. Subscribe to the cache feed and spawn the router
    #[tracing::instrument(skip(self), fields(mappings = self.mappings.len(), has_wal))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(EngineError::AlreadyStarted(state));
        }
        let startup_start = Instant::now();
        info!("Starting sync engine...");

        // ========== PHASE 1: Connectivity ==========
        self.set_state(EngineState::Connecting);
        let phase_start = Instant::now();
        if let Err(e) = self.check_connectivity().await {
            error!(error = %e, "Startup connectivity check failed");
            self.set_state(EngineState::Stopped);
            return Err(e);
        }
        crate::metrics::record_startup_phase("connect", phase_start.elapsed());

        // ========== PHASE 2: Write-ahead log ==========
        let phase_start = Instant::now();
        if let Some(path) = self.config.durable_log_path().map(str::to_string) {
            match WriteAheadLog::open(&path).await {
                Ok(wal) => {
                    tracing::Span::current().record("has_wal", true);
                    self.wal = Some(Arc::new(wal));
                }
                Err(e) => {
                    error!(path = %path, error = %e, "Failed to open write-ahead log");
                    crate::metrics::record_error("wal", "open", e.kind());
                    self.set_state(EngineState::Stopped);
                    return Err(e.into());
                }
            }
        } else {
            tracing::Span::current().record("has_wal", false);
            warn!("No wal_path configured - pending mutations are lost on crash");
        }
        crate::metrics::record_startup_phase("wal_open", phase_start.elapsed());

        // ========== PHASE 3: Lanes + recovery ==========
        self.set_state(EngineState::Recovering);
        let phase_start = Instant::now();
        self.lanes = Arc::new(self.build_lanes());
        if let Err(e) = self.recover().await {
            error!(error = %e, "Write-ahead log recovery failed");
            self.set_state(EngineState::Stopped);
            return Err(e.into());
        }
        crate::metrics::record_startup_phase("recover", phase_start.elapsed());

        // ========== PHASE 4: Workers ==========
        self.spawn_workers();

        // ========== PHASE 5: Event feed ==========
        let phase_start = Instant::now();
        let prefix = self.mappings.common_prefix();
        let events = match self.cache.subscribe(&prefix).await {
            Ok(events) => events,
            Err(e) => {
                error!(prefix = %prefix, error = %e, "Cache subscription failed");
                self.stop_tasks();
                self.set_state(EngineState::Stopped);
                return Err(EngineError::Connect { backend: "cache", source: e });
            }
        };
        let router = Router::new(
            self.mappings.clone(),
            self.lanes.clone(),
            self.echoes.clone(),
            self.observer.clone(),
            self.router_stats.clone(),
        );
        *self.router.lock() = Some(tokio::spawn(router.run(events)));
        crate::metrics::record_startup_phase("subscribe", phase_start.elapsed());

        self.set_state(EngineState::Running);
        crate::metrics::record_startup_total(startup_start.elapsed());
        info!(prefix = %prefix, lanes = self.lanes.len(), "Sync engine running");
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), EngineError> {
        let timeout = self.config.connect_timeout();
        let timed_out = |operation: &str| StorageError::Timeout {
            operation: operation.to_string(),
            timeout,
        };

        tokio::time::timeout(timeout, self.store.ping())
            .await
            .unwrap_or_else(|_| Err(timed_out("store_ping")))
            .map_err(|source| EngineError::Connect { backend: "store", source })?;

        tokio::time::timeout(timeout, self.cache.ping())
            .await
            .unwrap_or_else(|_| Err(timed_out("cache_ping")))
            .map_err(|source| EngineError::Connect { backend: "cache", source })?;

        debug!("Store and cache reachable");
        Ok(())
    }

    fn build_lanes(&self) -> Vec<Lane> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_fills));
        let fill_settings = self.config.fill_settings();
        let queue_config = self.config.queue_config();

        self.mappings
            .iter()
            .map(|mapping| Lane {
                mapping: mapping.clone(),
                fill: Arc::new(MissFillHandler::new(
                    mapping.clone(),
                    self.cache.clone(),
                    self.store.clone(),
                    self.observer.clone(),
                    fill_settings.clone(),
                    permits.clone(),
                    self.echoes.clone(),
                )),
                queue: Arc::new(WriteBehindQueue::new(
                    mapping.collection.clone(),
                    queue_config.clone(),
                    self.wal.clone(),
                )),
                persist: Arc::new(PersistStats::default()),
            })
            .collect()
    }

    /// Put every row left in the log back into its lane's queue.
    async fn recover(&self) -> Result<usize, StorageError> {
        let Some(wal) = &self.wal else { return Ok(0) };

        let pending = wal.load_pending().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(pending = pending.len(), "Restoring pending mutations from write-ahead log");

        let mut restored = 0;
        for entry in pending {
            match self.lane_for(&entry.cache_key) {
                Some(lane) => {
                    if lane.queue.restore(entry) {
                        restored += 1;
                    }
                }
                None => {
                    warn!(cache_key = %entry.cache_key, "Recovered entry matches no mapping, dead-lettered");
                    crate::metrics::record_dead_letter("unmapped", "unmapped");
                    wal.dead_letter(&DeadLetter::new(entry, "unmapped", None)).await?;
                }
            }
        }

        crate::metrics::record_wal_replay(restored);
        info!(restored, "Write-ahead log replayed");
        Ok(restored)
    }

    fn spawn_workers(&self) {
        let settings = self.config.worker_settings();
        let mut workers = self.workers.lock();

        for lane in self.lanes.iter() {
            for partition in 0..lane.queue.partition_count() {
                let worker = SyncWorker::new(
                    lane.mapping.clone(),
                    lane.queue.clone(),
                    self.store.clone(),
                    self.observer.clone(),
                    lane.persist.clone(),
                    partition,
                    settings.clone(),
                );
                workers.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));
            }
        }
        debug!(workers = workers.len(), "Sync workers spawned");
    }

    fn stop_tasks(&self) {
        for lane in self.lanes.iter() {
            lane.queue.close();
        }
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    /// Graceful shutdown.
    ///
    /// Workers drain their partitions for up to `shutdown_grace`. Then the
    /// queues close, the router stops and anything still running is
    /// aborted. Entries that were not acknowledged stay in the log and are
    /// replayed by the next start.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let state = self.state();
        if matches!(state, EngineState::Draining | EngineState::Stopped) {
            return;
        }

        let shutdown_start = Instant::now();
        info!(depth = self.queue_depth(), "Initiating sync engine shutdown...");
        self.set_state(EngineState::Draining);
        let _ = self.shutdown_tx.send(true);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        let grace = self.config.shutdown_grace();

        match tokio::time::timeout(grace, futures::future::join_all(workers)).await {
            Ok(_) => info!(elapsed_ms = shutdown_start.elapsed().as_millis() as u64, "Workers drained"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    remaining = self.queue_depth(),
                    "Drain grace expired, abandoning in-flight writes"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        self.stop_tasks();

        let remaining = self.queue_depth();
        if remaining > 0 && self.wal.is_none() {
            warn!(remaining, "Pending mutations discarded at shutdown; no write-ahead log");
        }

        if let Some(wal) = &self.wal {
            if let Err(e) = wal.checkpoint().await {
                warn!(error = %e, "Write-ahead log checkpoint failed");
            }
            // Give the single connection back before closing
            tokio::time::sleep(Duration::from_millis(1)).await;
            wal.close().await;
        }

        self.set_state(EngineState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Sync engine shutdown complete");
    }
}
