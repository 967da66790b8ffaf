//! Structured sync events for the observability collaborator.
//!
//! Every miss fill and every persistence attempt produces a [`SyncEvent`].
//! The engine hands them to a [`SyncObserver`]; the default
//! [`MetricsObserver`] turns them into `metrics` series and `tracing`
//! records. Tests use [`RecordingObserver`] to assert on the exact sequence.
//!
//! # Example
//!
//! ```
//! use cache_sync::{RecordingObserver, SyncEvent, SyncEventKind, SyncObserver, SyncOutcome};
//! use std::time::Duration;
//!
//! let observer = RecordingObserver::new();
//! observer.observe(&SyncEvent::new(
//!     SyncEventKind::Fetch,
//!     "UserEntity:u1",
//!     SyncOutcome::Filled,
//!     1,
//!     Duration::from_millis(2),
//! ));
//! assert_eq!(observer.count(SyncEventKind::Fetch, SyncOutcome::Filled), 1);
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Which side of the engine produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
    /// Read-through: store lookup on a cache miss
    Fetch,
    /// Write-behind (or write-through): store upsert/delete
    Persist,
}

impl SyncEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Persist => "persist",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOutcome {
    /// Record found and written to the cache
    Filled,
    /// Record does not exist; cache untouched
    Absent,
    /// One attempt failed (fetch or persist); more may follow
    Failed,
    /// Store write confirmed and acknowledged
    Persisted,
    /// Payload could not be parsed; entry dropped
    Poisoned,
    /// Entry given up on and moved to the dead-letter log
    DeadLettered,
    /// Entry evicted by the overflow policy
    Dropped,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filled => "filled",
            Self::Absent => "absent",
            Self::Failed => "failed",
            Self::Persisted => "persisted",
            Self::Poisoned => "poisoned",
            Self::DeadLettered => "dead_lettered",
            Self::Dropped => "dropped",
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observable step of a fill or a persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    pub cache_key: String,
    pub outcome: SyncOutcome,
    /// 1-based attempt number this event refers to
    pub attempt_count: u32,
    pub latency: Duration,
    pub error: Option<String>,
}

impl SyncEvent {
    pub fn new(
        kind: SyncEventKind,
        cache_key: impl Into<String>,
        outcome: SyncOutcome,
        attempt_count: u32,
        latency: Duration,
    ) -> Self {
        Self {
            kind,
            cache_key: cache_key.into(),
            outcome,
            attempt_count,
            latency,
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receiver of sync events. Must be cheap; called inline on hot paths.
pub trait SyncObserver: Send + Sync {
    fn observe(&self, event: &SyncEvent);
}

/// Default observer: `tracing` records plus `metrics` counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl SyncObserver for MetricsObserver {
    fn observe(&self, event: &SyncEvent) {
        let kind = event.kind.as_str();
        match event.outcome {
            SyncOutcome::Filled | SyncOutcome::Absent | SyncOutcome::Persisted => {
                debug!(
                    kind,
                    cache_key = %event.cache_key,
                    outcome = %event.outcome,
                    attempt = event.attempt_count,
                    latency_ms = event.latency.as_millis() as u64,
                    "Sync event"
                );
            }
            SyncOutcome::Failed => {
                debug!(
                    kind,
                    cache_key = %event.cache_key,
                    attempt = event.attempt_count,
                    error = event.error.as_deref().unwrap_or(""),
                    "Sync attempt failed"
                );
            }
            SyncOutcome::Dropped => {
                warn!(kind, cache_key = %event.cache_key, "Pending entry dropped by overflow policy");
            }
            SyncOutcome::Poisoned | SyncOutcome::DeadLettered => {
                error!(
                    kind,
                    cache_key = %event.cache_key,
                    outcome = %event.outcome,
                    attempt = event.attempt_count,
                    error = event.error.as_deref().unwrap_or(""),
                    "Pending entry abandoned"
                );
            }
        }

        metrics::counter!(
            "cache_sync_events_total",
            "kind" => kind,
            "outcome" => event.outcome.as_str()
        )
        .increment(1);
        metrics::histogram!("cache_sync_event_seconds", "kind" => kind)
            .record(event.latency.as_secs_f64());
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Events for one key, in order.
    #[must_use]
    pub fn events_for(&self, cache_key: &str) -> Vec<SyncEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.cache_key == cache_key)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, kind: SyncEventKind, outcome: SyncOutcome) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind && e.outcome == outcome)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl SyncObserver for RecordingObserver {
    fn observe(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fan out to several observers.
impl<A: SyncObserver, B: SyncObserver> SyncObserver for (A, B) {
    fn observe(&self, event: &SyncEvent) {
        self.0.observe(event);
        self.1.observe(event);
    }
}

impl<T: SyncObserver + ?Sized> SyncObserver for std::sync::Arc<T> {
    fn observe(&self, event: &SyncEvent) {
        (**self).observe(event);
    }
}
