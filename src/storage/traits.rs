//! Narrow interfaces to the two external collaborators.
//!
//! - [`CacheClient`]: the key-value cache (get/set/delete + event feed)
//! - [`StoreClient`]: the durable document store (lookup/upsert/delete by primary key)
//!
//! Both are `Send + Sync` and used as `Arc<dyn _>` so implementations must be
//! safe for concurrent use (pooled connections, not a single shared handle).

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::change_event::CacheEvent;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Generic backend failure (connection reset, driver error). Retryable.
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Could not reach the backend at all. Retryable.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The per-attempt deadline expired. Retryable.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    /// Payload or record could not be (de)serialized. Never retried.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The backend refused the operation for a reason retrying cannot fix.
    #[error("Rejected by backend: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Connection(_) | Self::Timeout { .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::Connection(_) => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Live feed of cache events. Unbounded and non-restartable: once the
/// sender side is dropped the feed is over.
pub type CacheEventStream = mpsc::UnboundedReceiver<CacheEvent>;

#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Set with an expiry. Default implementation ignores the TTL.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let _ = ttl;
        self.set(key, value).await
    }

    /// Subscribe to miss/change notifications for keys starting with
    /// `prefix_filter` (empty filter = every key).
    async fn subscribe(&self, prefix_filter: &str) -> Result<CacheEventStream, StorageError>;

    /// Connectivity check used at startup.
    async fn ping(&self) -> Result<(), StorageError>;
}

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Point lookup. `Ok(None)` means the record does not exist, which is a
    /// valid outcome rather than an error.
    async fn lookup(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Value>, StorageError>;

    /// Insert or replace the record whose `field` equals `value`.
    async fn upsert(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        record: &Value,
    ) -> Result<(), StorageError>;

    /// Delete the record whose `field` equals `value`. Deleting a missing
    /// record is not an error.
    async fn delete(&self, collection: &str, field: &str, value: &str) -> Result<(), StorageError>;

    /// Connectivity check used at startup.
    async fn ping(&self) -> Result<(), StorageError>;
}
