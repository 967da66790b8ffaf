// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL document store (MySQL or SQLite through the sqlx `Any` driver).
//!
//! Each collection is a table of JSON documents keyed by primary-key value:
//!
//! ```sql
//! CREATE TABLE users (
//!   pk VARCHAR(255) PRIMARY KEY,   -- value of the mapping's primary-key field
//!   document LONGTEXT NOT NULL,    -- the record, serialized JSON
//!   updated_at BIGINT NOT NULL     -- epoch millis of the last write
//! )
//! ```
//!
//! Tables are created on first use. Collection names become table names,
//! so they are restricted to ASCII letters, digits and underscores.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL LONGTEXT comes back as bytes through `Any`, so documents are read
//! as `String` first and `Vec<u8>` second. Store calls are single-shot:
//! the miss-fill and write-behind paths own the retry policy.

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::Value;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{StorageError, StoreClient};
use crate::change_event::now_millis;
use crate::metrics::LatencyTimer;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub(crate) fn sql_err(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Connection(e.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

/// Read a text column that may arrive as TEXT (SQLite) or bytes (MySQL).
pub(crate) fn read_text(row: &sqlx::any::AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn valid_table_name(collection: &str) -> bool {
    !collection.is_empty()
        && collection.len() <= 64
        && collection.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !collection.starts_with(|c: char| c.is_ascii_digit())
}

pub struct SqlDocumentStore {
    pool: AnyPool,
    is_sqlite: bool,
    /// Tables known to exist
    tables: DashSet<String>,
}

impl SqlDocumentStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))
        })
        .await?;

        if is_sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await
                .map_err(sql_err)?;
        }

        info!(sqlite = is_sqlite, "SQL document store connected");
        Ok(Self {
            pool,
            is_sqlite,
            tables: DashSet::new(),
        })
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn ensure_table(&self, collection: &str) -> Result<(), StorageError> {
        if self.tables.contains(collection) {
            return Ok(());
        }
        if !valid_table_name(collection) {
            return Err(StorageError::Rejected(format!(
                "collection '{}' is not a valid table name",
                collection
            )));
        }

        let sql = if self.is_sqlite {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    pk TEXT PRIMARY KEY,
                    document TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                collection
            )
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    pk VARCHAR(255) PRIMARY KEY,
                    document LONGTEXT NOT NULL,
                    updated_at BIGINT NOT NULL
                ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
                collection
            )
        };
        sqlx::query(&sql).execute(&self.pool).await.map_err(sql_err)?;

        debug!(collection, "Collection table ready");
        self.tables.insert(collection.to_string());
        Ok(())
    }
}

#[async_trait]
impl StoreClient for SqlDocumentStore {
    async fn lookup(&self, collection: &str, _field: &str, value: &str) -> Result<Option<Value>, StorageError> {
        self.ensure_table(collection).await?;
        let _timer = LatencyTimer::new("sql_lookup", collection);

        let sql = format!("SELECT document FROM {} WHERE pk = ?", collection);
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let text = read_text(&row, "document")
                    .ok_or_else(|| StorageError::Serialization("document column unreadable".into()))?;
                Ok(Some(serde_json::from_str(&text)?))
            }
        }
    }

    async fn upsert(&self, collection: &str, _field: &str, value: &str, record: &Value) -> Result<(), StorageError> {
        self.ensure_table(collection).await?;

        let document = serde_json::to_string(record)?;
        let _timer = LatencyTimer::new("sql_upsert", collection);
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO {} (pk, document, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(pk) DO UPDATE SET
                    document = excluded.document,
                    updated_at = excluded.updated_at",
                collection
            )
        } else {
            format!(
                "INSERT INTO {} (pk, document, updated_at) VALUES (?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    document = VALUES(document),
                    updated_at = VALUES(updated_at)",
                collection
            )
        };

        sqlx::query(&sql)
            .bind(value)
            .bind(&document)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn delete(&self, collection: &str, _field: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_table(collection).await?;

        let _timer = LatencyTimer::new("sql_delete", collection);

        let sql = format!("DELETE FROM {} WHERE pk = ?", collection);
        sqlx::query(&sql)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}
