// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] is the composition root. Per mapping it owns a *lane*:
//! a [`MissFillHandler`], a [`WriteBehindQueue`] and one [`SyncWorker`] per
//! queue partition. A single router task reads the cache event feed and
//! dispatches each event to the lane whose prefix matches.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Recovering → Running → Draining → Stopped
//! ```
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use cache_sync::{EngineState, InMemoryCache, InMemoryStore, Mapping, SyncEngine, SyncEngineConfig};
//! use std::sync::Arc;
//!
//! let config = SyncEngineConfig {
//!     mappings: vec![Mapping::new("UserEntity:", "users", "userID")],
//!     wal_path: None,
//!     ..Default::default()
//! };
//! let mut engine = SyncEngine::new(
//!     config,
//!     Arc::new(InMemoryCache::new()),
//!     Arc::new(InMemoryStore::new()),
//! )
//! .unwrap();
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.unwrap();
//! assert_eq!(engine.state(), EngineState::Running);
//!
//! engine.shutdown().await;
//! assert_eq!(engine.state(), EngineState::Stopped);
//! # }
//! ```

mod api;
mod lifecycle;
mod router;
mod types;

pub use types::{EngineError, EngineState, EngineStats};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, SyncEngineConfig};
use crate::fill::{FillEchoes, MissFillHandler};
use crate::mapping::{Mapping, MappingTable};
use crate::observe::{MetricsObserver, SyncObserver};
use crate::queue::WriteBehindQueue;
use crate::resilience::wal::WriteAheadLog;
use crate::storage::redis::RedisCache;
use crate::storage::sql::SqlDocumentStore;
use crate::storage::traits::{CacheClient, StoreClient};
use crate::worker::PersistStats;

/// Everything the engine runs for one mapping.
pub(crate) struct Lane {
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) fill: Arc<MissFillHandler>,
    pub(crate) queue: Arc<WriteBehindQueue>,
    pub(crate) persist: Arc<PersistStats>,
}

/// Main sync engine coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. Lanes are built once by
/// [`start()`](Self::start) and shared read-only with the spawned tasks.
pub struct SyncEngine {
    pub(super) config: SyncEngineConfig,

    /// Validated routing table (index = lane id)
    pub(super) mappings: Arc<MappingTable>,

    pub(super) cache: Arc<dyn CacheClient>,
    pub(super) store: Arc<dyn StoreClient>,
    pub(super) observer: Arc<dyn SyncObserver>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// One lane per mapping, empty until started
    pub(super) lanes: Arc<Vec<Lane>>,

    /// Fill payloads awaiting their change-event echo
    pub(super) echoes: Arc<FillEchoes>,

    /// Durable queue log, if configured
    pub(super) wal: Option<Arc<WriteAheadLog>>,

    /// `true` once shutdown starts; workers drain and exit
    pub(super) shutdown_tx: watch::Sender<bool>,

    pub(super) workers: Mutex<Vec<JoinHandle<()>>>,
    pub(super) router: Mutex<Option<JoinHandle<()>>>,
    pub(super) router_stats: Arc<router::RouterStats>,
}

impl SyncEngine {
    /// Create a new sync engine over the given clients.
    ///
    /// Validates the configuration (a bad mapping is fatal). The engine
    /// starts in `Created` state; call [`start()`](Self::start) to run it.
    pub fn new(
        config: SyncEngineConfig,
        cache: Arc<dyn CacheClient>,
        store: Arc<dyn StoreClient>,
    ) -> Result<Self, EngineError> {
        let mappings = config.validate()?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            echoes: Arc::new(FillEchoes::new(config.echo_window())),
            config,
            mappings: Arc::new(mappings),
            cache,
            store,
            observer: Arc::new(MetricsObserver),
            state: state_tx,
            state_rx,
            lanes: Arc::new(Vec::new()),
            wal: None,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            router: Mutex::new(None),
            router_stats: Arc::new(router::RouterStats::default()),
        })
    }

    /// Build the bundled Redis cache and SQL store clients from the
    /// configured URLs, then [`new`](Self::new).
    pub async fn connect(config: SyncEngineConfig) -> Result<Self, EngineError> {
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| ConfigError::Invalid("redis_url is required".into()))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| ConfigError::Invalid("sql_url is required".into()))?;

        let cache = RedisCache::connect(&redis_url, config.redis_options())
            .await
            .map_err(|source| EngineError::Connect { backend: "cache", source })?;
        let store = SqlDocumentStore::connect(&sql_url)
            .await
            .map_err(|source| EngineError::Connect { backend: "store", source })?;

        Self::new(config, Arc::new(cache), Arc::new(store))
    }

    /// Replace the default [`MetricsObserver`]. Only effective before start.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    #[must_use]
    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    #[must_use]
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    /// Lane for a cache key, by longest-prefix match.
    pub(super) fn lane_for(&self, cache_key: &str) -> Option<&Lane> {
        let (idx, _) = self.mappings.route(cache_key)?;
        self.lanes.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryCache, InMemoryStore};

    fn engine(mappings: Vec<Mapping>) -> Result<SyncEngine, EngineError> {
        SyncEngine::new(
            SyncEngineConfig { mappings, ..Default::default() },
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryStore::new()),
        )
    }

    #[test]
    fn test_new_validates_mappings() {
        assert!(matches!(engine(vec![]), Err(EngineError::Config(ConfigError::NoMappings))));
        assert!(matches!(
            engine(vec![
                Mapping::new("User:", "users", "id"),
                Mapping::new("User:Admin:", "admins", "id"),
            ]),
            Err(EngineError::Config(ConfigError::AmbiguousPrefix { .. }))
        ));
    }

    #[test]
    fn test_new_engine_is_created() {
        let engine = engine(vec![Mapping::new("UserEntity:", "users", "userID")]).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert_eq!(engine.mappings().len(), 1);
        assert!(engine.lane_for("UserEntity:u1").is_none());
    }
}
