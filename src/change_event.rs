//! Events produced by the cache and the pending-mutation entries built from them.
//!
//! # Example
//!
//! ```
//! use cache_sync::{ChangeEvent, ChangeOp};
//!
//! let set = ChangeEvent::set("TransactionEntity:t9", b"{\"amount\":10}".to_vec(), 7);
//! assert_eq!(set.op, ChangeOp::Set);
//! assert!(set.payload.is_some());
//!
//! let del = ChangeEvent::delete("TransactionEntity:t9", 8);
//! assert!(del.payload.is_none());
//! ```

use serde::{Deserialize, Serialize};

/// Kind of mutation observed on the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Set,
    Delete,
}

impl ChangeOp {
    /// Column/label representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Set => "SET",
            ChangeOp::Delete => "DEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SET" => Some(ChangeOp::Set),
            "DEL" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write or delete observed on a cache key.
///
/// `payload` is present iff `op == Set`. Sequence numbers come from the
/// producing cache client and increase strictly per client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub cache_key: String,
    pub op: ChangeOp,
    pub payload: Option<Vec<u8>>,
    pub sequence: u64,
}

impl ChangeEvent {
    pub fn set(cache_key: impl Into<String>, payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            cache_key: cache_key.into(),
            op: ChangeOp::Set,
            payload: Some(payload),
            sequence,
        }
    }

    pub fn delete(cache_key: impl Into<String>, sequence: u64) -> Self {
        Self {
            cache_key: cache_key.into(),
            op: ChangeOp::Delete,
            payload: None,
            sequence,
        }
    }

    /// Approximate payload size, for metrics.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}

/// Everything the cache event feed can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A read found nothing under `cache_key`.
    Miss { cache_key: String },
    /// A key was written or deleted.
    Change(ChangeEvent),
}

impl CacheEvent {
    #[must_use]
    pub fn cache_key(&self) -> &str {
        match self {
            CacheEvent::Miss { cache_key } => cache_key,
            CacheEvent::Change(ev) => &ev.cache_key,
        }
    }
}

/// A mutation waiting to be persisted to the document store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub cache_key: String,
    /// Latest event for this key (older ones were coalesced away).
    pub latest: ChangeEvent,
    /// Epoch millis when the entry was first queued.
    pub enqueued_at: i64,
    /// Failed persistence attempts so far.
    pub attempt_count: u32,
}

impl PendingEntry {
    pub fn new(event: ChangeEvent) -> Self {
        Self {
            cache_key: event.cache_key.clone(),
            latest: event,
            enqueued_at: now_millis(),
            attempt_count: 0,
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.latest.sequence
    }

    /// How long the entry has been waiting, in millis.
    #[must_use]
    pub fn age_millis(&self) -> i64 {
        (now_millis() - self.enqueued_at).max(0)
    }
}

/// A pending entry that was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub entry: PendingEntry,
    /// `poison`, `max_attempts`, `max_age`, `rejected`, `overflow`, `unmapped`
    pub reason: String,
    pub error: Option<String>,
    /// Epoch millis
    pub dead_lettered_at: i64,
}

impl DeadLetter {
    pub fn new(entry: PendingEntry, reason: impl Into<String>, error: Option<String>) -> Self {
        Self {
            entry,
            reason: reason.into(),
            error,
            dead_lettered_at: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
