//! Public types for the sync engine coordinator.

use thiserror::Error;

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::storage::traits::StorageError;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Checking cache and store connectivity
    Connecting,
    /// Restoring pending mutations from the write-ahead log
    Recovering,
    /// Routing events, workers persisting
    Running,
    /// Shutdown requested; workers draining their partitions
    Draining,
    /// All tasks stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Running => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Startup connectivity check failed. Not retried.
    #[error("{backend} unreachable: {source}")]
    Connect {
        backend: &'static str,
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("engine is {0}, operation needs Running")]
    NotRunning(EngineState),
    #[error("engine already started (state {0})")]
    AlreadyStarted(EngineState),
    #[error("no mapping for cache key '{0}'")]
    Unmapped(String),
    #[error("fill of '{cache_key}' failed after {attempts} attempts: {error}")]
    FillFailed {
        cache_key: String,
        attempts: u32,
        error: String,
    },
}

/// Counters since startup, summed over every mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub filled: u64,
    pub absent: u64,
    pub fill_failures: u64,
    /// Misses absorbed by an in-progress fill of the same key
    pub coalesced_fills: u64,
    pub persisted: u64,
    /// Failed persistence attempts (retried or not)
    pub persist_failures: u64,
    pub poisoned: u64,
    /// Entries given up on after retries or rejection
    pub dead_lettered: u64,
    /// Entries evicted by the drop-oldest overflow policy
    pub dropped: u64,
    /// Change events folded into an already pending entry
    pub coalesced: u64,
    /// Change events recognised as the echo of a fill
    pub echoes_suppressed: u64,
    pub queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Recovering), "Recovering");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }

    #[test]
    fn test_engine_error_messages() {
        let err = EngineError::Connect {
            backend: "store",
            source: StorageError::Connection("refused".into()),
        };
        assert_eq!(err.to_string(), "store unreachable: Connection error: refused");

        let err: EngineError = ConfigError::NoMappings.into();
        assert!(matches!(err, EngineError::Config(ConfigError::NoMappings)));
    }
}
