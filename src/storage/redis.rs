//! Redis cache client with keyspace-notification event feed.
//!
//! Values are plain strings (`GET`/`SET`) or RedisJSON documents
//! (`JSON.GET`/`JSON.SET`), chosen by [`ValueFormat`].
//!
//! The event feed subscribes to keyspace notifications for the prefix:
//!
//! ```text
//! PSUBSCRIBE __keyspace@0__:UserEntity:*
//!
//! keymiss             → CacheEvent::Miss
//! set / json.set      → GET the value → CacheEvent::Change(SET)
//! del / json.del      → CacheEvent::Change(DEL)
//! expired / evicted   → ignored (cache lifecycle, not a user delete)
//! ```
//!
//! Notifications must be enabled on the server (`notify-keyspace-events`
//! with `K`, `A` and `m`). The client can set that itself on connect.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::{CacheClient, CacheEventStream, StorageError};
use crate::change_event::{CacheEvent, ChangeEvent};
use crate::resilience::retry::{retry, RetryConfig};

/// Notification classes: keyspace, all generic/type events, key misses.
const NOTIFY_EVENTS: &str = "KAm";

/// How values are stored in Redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFormat {
    /// Redis STRING via `GET`/`SET`
    #[default]
    String,
    /// RedisJSON document via `JSON.GET`/`JSON.SET` (Redis Stack)
    Json,
}

#[derive(Debug, Clone)]
pub struct RedisCacheOptions {
    pub format: ValueFormat,
    /// Logical database, for the notification channel name.
    /// `None` takes it from the connection URL.
    pub db: Option<i64>,
    pub configure_notifications: bool,
}

impl Default for RedisCacheOptions {
    fn default() -> Self {
        Self {
            format: ValueFormat::String,
            db: None,
            configure_notifications: true,
        }
    }
}

/// What a keyspace notification means for the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyspaceAction {
    Miss,
    Read { json: bool },
    Delete,
    Ignore,
}

fn classify(event: &str) -> KeyspaceAction {
    match event {
        "keymiss" => KeyspaceAction::Miss,
        "set" => KeyspaceAction::Read { json: false },
        "json.set" | "json.merge" => KeyspaceAction::Read { json: true },
        "del" | "json.del" => KeyspaceAction::Delete,
        _ => KeyspaceAction::Ignore,
    }
}

/// Escape glob metacharacters so a prefix matches literally in PSUBSCRIBE.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn redis_err(e: redis::RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout {
            operation: "redis".to_string(),
            timeout: Duration::ZERO,
        }
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StorageError::Connection(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

pub struct RedisCache {
    client: Client,
    connection: ConnectionManager,
    format: ValueFormat,
    db: i64,
    configure_notifications: bool,
    /// Seeded from wall-clock micros so sequences keep increasing across restarts
    sequence: Arc<AtomicU64>,
}

impl RedisCache {
    pub async fn connect(connection_string: &str, options: RedisCacheOptions) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(redis_err)?;

        let db = options.db.unwrap_or(client.get_connection_info().redis.db);
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        info!(db, format = ?options.format, "Redis cache connected");
        Ok(Self {
            client,
            connection,
            format: options.format,
            db,
            configure_notifications: options.configure_notifications,
            sequence: Arc::new(AtomicU64::new(seed)),
        })
    }

    /// Clone of the underlying connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    #[must_use]
    pub fn format(&self) -> ValueFormat {
        self.format
    }

    async fn enable_notifications(&self) {
        let mut conn = self.connection.clone();
        let result: Result<(), redis::RedisError> = cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(NOTIFY_EVENTS)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => debug!(events = NOTIFY_EVENTS, "Keyspace notifications enabled"),
            // Managed Redis often forbids CONFIG; the operator must set it
            Err(e) => warn!(error = %e, "Could not enable keyspace notifications, relying on server config"),
        }
    }
}

/// Read a key's value with the command matching its type.
async fn read_value(conn: &mut ConnectionManager, key: &str, json: bool) -> Result<Option<Vec<u8>>, redis::RedisError> {
    if json {
        let doc: Option<String> = cmd("JSON.GET").arg(key).query_async(conn).await?;
        Ok(doc.map(String::into_bytes))
    } else {
        conn.get(key).await
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.connection.clone();
        let json = self.format == ValueFormat::Json;
        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move { read_value(&mut conn, key, json).await }
        })
        .await
        .map_err(redis_err)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.set_with_ttl(key, value, None).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let format = self.format;
        let ttl_ms = ttl.map(|t| t.as_millis().max(1) as u64);

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                match format {
                    ValueFormat::String => {
                        let mut set = cmd("SET");
                        set.arg(key).arg(value);
                        if let Some(ms) = ttl_ms {
                            set.arg("PX").arg(ms);
                        }
                        let _: () = set.query_async(&mut conn).await?;
                    }
                    ValueFormat::Json => {
                        let _: () = cmd("JSON.SET").arg(key).arg("$").arg(value).query_async(&mut conn).await?;
                        if let Some(ms) = ttl_ms {
                            let _: () = cmd("PEXPIRE").arg(key).arg(ms).query_async(&mut conn).await?;
                        }
                    }
                }
                Ok(())
            }
        })
        .await
        .map_err(redis_err)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let _: () = conn.del(key).await?;
                Ok(())
            }
        })
        .await
        .map_err(redis_err)
    }

    async fn subscribe(&self, prefix_filter: &str) -> Result<CacheEventStream, StorageError> {
        if self.configure_notifications {
            self.enable_notifications().await;
        }

        let channel_prefix = format!("__keyspace@{}__:", self.db);
        let pattern = format!("{}{}*", channel_prefix, escape_glob(prefix_filter));

        let mut pubsub = self.client.get_async_pubsub().await.map_err(redis_err)?;
        pubsub.psubscribe(&pattern).await.map_err(redis_err)?;
        info!(pattern = %pattern, "Subscribed to keyspace notifications");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut conn = self.connection.clone();
        let sequence = self.sequence.clone();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                if tx.is_closed() {
                    break;
                }
                let Some(key) = msg.get_channel_name().strip_prefix(channel_prefix.as_str()) else {
                    continue;
                };
                let event: String = match msg.get_payload() {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "Unreadable keyspace payload");
                        continue;
                    }
                };

                let cache_event = match classify(&event) {
                    KeyspaceAction::Miss => CacheEvent::Miss { cache_key: key.to_string() },
                    KeyspaceAction::Delete => {
                        let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                        CacheEvent::Change(ChangeEvent::delete(key, seq))
                    }
                    KeyspaceAction::Read { json } => {
                        // Sequence taken at notification time, before the read
                        let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                        match read_value(&mut conn, key, json).await {
                            Ok(Some(value)) => CacheEvent::Change(ChangeEvent::set(key, value, seq)),
                            Ok(None) => {
                                debug!(cache_key = key, "Key gone before it could be read, skipped");
                                continue;
                            }
                            Err(e) => {
                                warn!(cache_key = key, error = %e, "Failed to read changed key, change lost");
                                crate::metrics::record_error("redis", "read_changed", "backend");
                                continue;
                            }
                        }
                    }
                    KeyspaceAction::Ignore => continue,
                };

                if tx.send(cache_event).is_err() {
                    break;
                }
            }
            warn!("Keyspace notification feed ended");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let pong: String = cmd("PING").query_async(&mut conn).await.map_err(redis_err)?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }
}
