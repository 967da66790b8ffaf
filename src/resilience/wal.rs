//! Write-ahead log for pending write-behind mutations.
//!
//! Every coalesced pending entry is mirrored to a local SQLite database
//! before it becomes visible to workers, and removed only once a worker
//! acknowledges it. After a crash the rows still present are exactly the
//! mutations that never reached the document store; the engine restores
//! them into their queues before workers start.
//!
//! One row per cache key (the latest event wins), so the log never grows
//! beyond the number of distinct dirty keys. Entries that are given up on
//! move to the `dead_letters` table for manual intervention.
//!
//! This is NOT a store - it's a durability buffer. Rows in the log are
//! "in flight" to the document store, not a permanent storage location.

use crate::change_event::{ChangeEvent, ChangeOp, DeadLetter, PendingEntry};
use crate::storage::sql::{install_drivers, read_text};
use crate::storage::traits::StorageError;
use crate::resilience::retry::{retry, RetryConfig};
use sqlx::{AnyPool, Row, any::AnyPoolOptions, any::AnyRow};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// WAL state for observability
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    /// Rows written (including coalescing overwrites) since startup
    pub total_written: u64,
    /// Rows removed by acknowledgement since startup
    pub total_acked: u64,
    /// Rows moved to the dead-letter table since startup
    pub total_dead_lettered: u64,
}

/// Write-ahead log backed by SQLite.
pub struct WriteAheadLog {
    pool: AnyPool,
    /// Path to SQLite file (for display)
    path: String,
    total_written: AtomicU64,
    total_acked: AtomicU64,
    total_dead_lettered: AtomicU64,
}

fn backend(context: &str) -> impl Fn(sqlx::Error) -> StorageError + '_ {
    move |e| StorageError::Backend(format!("{}: {}", context, e))
}

impl WriteAheadLog {
    /// Open (or create) the log at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        install_drivers();

        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        info!(path = %path_str, "Opening write-ahead log");

        // Single connection: every write is a short critical section and
        // SQLite serializes writers anyway.
        let pool = retry("wal_open", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let wal = Self {
            pool,
            path: path_str,
            total_written: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_dead_lettered: AtomicU64::new(0),
        };
        wal.init_schema().await?;

        let pending = wal.count_pending().await?;
        if pending > 0 {
            warn!(pending, "WAL has entries from previous run, will replay");
        }

        Ok(wal)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(backend("Failed to enable WAL mode"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_mutations (
                cache_key TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                op TEXT NOT NULL,
                payload BLOB,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend("Failed to create pending_mutations"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cache_key TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                op TEXT NOT NULL,
                payload BLOB,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                reason TEXT NOT NULL,
                error TEXT,
                dead_lettered_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend("Failed to create dead_letters"))?;

        Ok(())
    }

    /// Record the latest pending state of a key. Rows holding a newer
    /// sequence are left untouched.
    pub async fn append(&self, entry: &PendingEntry) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO pending_mutations (cache_key, sequence, op, payload, enqueued_at, attempts)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                sequence = excluded.sequence,
                op = excluded.op,
                payload = excluded.payload,
                attempts = excluded.attempts
             WHERE excluded.sequence > pending_mutations.sequence",
        )
        .bind(&entry.cache_key)
        .bind(entry.sequence() as i64)
        .bind(entry.latest.op.as_str())
        .bind(&entry.latest.payload)
        .bind(entry.enqueued_at)
        .bind(i64::from(entry.attempt_count))
        .execute(&self.pool)
        .await
        .map_err(backend("WAL append failed"))?;

        self.total_written.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key = %entry.cache_key, sequence = entry.sequence(), "Entry written to WAL");
        Ok(())
    }

    /// Remove the row for `cache_key` if it holds `sequence` or older.
    /// Returns whether a row was removed.
    pub async fn acknowledge(&self, cache_key: &str, sequence: u64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM pending_mutations WHERE cache_key = ? AND sequence <= ?")
            .bind(cache_key)
            .bind(sequence as i64)
            .execute(&self.pool)
            .await
            .map_err(backend("WAL acknowledge failed"))?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.total_acked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Persist the attempt counter so it survives restarts.
    pub async fn record_attempt(
        &self,
        cache_key: &str,
        sequence: u64,
        attempts: u32,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE pending_mutations SET attempts = ? WHERE cache_key = ? AND sequence = ?")
            .bind(i64::from(attempts))
            .bind(cache_key)
            .bind(sequence as i64)
            .execute(&self.pool)
            .await
            .map_err(backend("WAL attempt update failed"))?;
        Ok(())
    }

    /// Move an entry to the dead-letter table and drop its pending row
    /// (unless a newer event has replaced it).
    pub async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        let entry = &letter.entry;
        let mut tx = self.pool.begin().await.map_err(backend("WAL transaction failed"))?;

        sqlx::query(
            "INSERT INTO dead_letters (cache_key, sequence, op, payload, enqueued_at, attempts, reason, error, dead_lettered_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.cache_key)
        .bind(entry.sequence() as i64)
        .bind(entry.latest.op.as_str())
        .bind(&entry.latest.payload)
        .bind(entry.enqueued_at)
        .bind(i64::from(entry.attempt_count))
        .bind(&letter.reason)
        .bind(&letter.error)
        .bind(letter.dead_lettered_at)
        .execute(&mut *tx)
        .await
        .map_err(backend("WAL dead-letter insert failed"))?;

        sqlx::query("DELETE FROM pending_mutations WHERE cache_key = ? AND sequence <= ?")
            .bind(&entry.cache_key)
            .bind(entry.sequence() as i64)
            .execute(&mut *tx)
            .await
            .map_err(backend("WAL dead-letter delete failed"))?;

        tx.commit().await.map_err(backend("WAL commit failed"))?;

        self.total_dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// All rows still pending, oldest first.
    pub async fn load_pending(&self) -> Result<Vec<PendingEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT cache_key, sequence, op, payload, enqueued_at, attempts
             FROM pending_mutations ORDER BY enqueued_at, cache_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend("WAL scan failed"))?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    /// Most recent dead letters first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StorageError> {
        let rows = sqlx::query(
            "SELECT cache_key, sequence, op, payload, enqueued_at, attempts, reason, error, dead_lettered_at
             FROM dead_letters ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend("WAL dead-letter scan failed"))?;

        rows.iter()
            .map(|row| {
                let entry = Self::entry_from_row(row)?;
                Ok(DeadLetter {
                    entry,
                    reason: read_text(row, "reason").unwrap_or_default(),
                    error: read_text(row, "error"),
                    dead_lettered_at: row.try_get("dead_lettered_at").unwrap_or(0),
                })
            })
            .collect()
    }

    pub async fn count_pending(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM pending_mutations")
            .fetch_one(&self.pool)
            .await
            .map_err(backend("WAL count failed"))?;
        let count: i64 = row.try_get("cnt").map_err(backend("WAL count failed"))?;
        Ok(count as u64)
    }

    fn entry_from_row(row: &AnyRow) -> Result<PendingEntry, StorageError> {
        let cache_key = read_text(row, "cache_key")
            .ok_or_else(|| StorageError::Backend("WAL row without cache_key".into()))?;
        let sequence: i64 = row.try_get("sequence").map_err(backend("WAL row decode failed"))?;
        let op = read_text(row, "op")
            .as_deref()
            .and_then(ChangeOp::parse)
            .ok_or_else(|| StorageError::Serialization(format!("WAL row for {} has unknown op", cache_key)))?;
        let payload: Option<Vec<u8>> = row.try_get::<Option<Vec<u8>>, _>("payload").ok().flatten();
        let enqueued_at: i64 = row.try_get("enqueued_at").unwrap_or(0);
        let attempts: i64 = row.try_get("attempts").unwrap_or(0);

        let latest = match op {
            ChangeOp::Set => ChangeEvent::set(cache_key.clone(), payload.unwrap_or_default(), sequence as u64),
            ChangeOp::Delete => ChangeEvent::delete(cache_key.clone(), sequence as u64),
        };

        Ok(PendingEntry {
            cache_key,
            latest,
            enqueued_at,
            attempt_count: u32::try_from(attempts).unwrap_or(u32::MAX),
        })
    }

    /// Run a WAL checkpoint to reclaim disk space.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(backend("WAL checkpoint failed"))?;

        debug!(path = %self.path, "WAL checkpoint completed");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> WalStats {
        WalStats {
            total_written: self.total_written.load(Ordering::Relaxed),
            total_acked: self.total_acked.load(Ordering::Relaxed),
            total_dead_lettered: self.total_dead_lettered.load(Ordering::Relaxed),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the pool, flushing SQLite's own journal.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set_entry(key: &str, payload: &str, sequence: u64) -> PendingEntry {
        PendingEntry::new(ChangeEvent::set(key, payload.as_bytes().to_vec(), sequence))
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.db")).await.unwrap();

        wal.append(&set_entry("UserEntity:u1", r#"{"name":"Ann"}"#, 1)).await.unwrap();
        wal.append(&PendingEntry::new(ChangeEvent::delete("UserEntity:u2", 2))).await.unwrap();

        let pending = wal.load_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        let u1 = pending.iter().find(|e| e.cache_key == "UserEntity:u1").unwrap();
        assert_eq!(u1.latest.payload.as_deref(), Some(br#"{"name":"Ann"}"#.as_slice()));
        let u2 = pending.iter().find(|e| e.cache_key == "UserEntity:u2").unwrap();
        assert_eq!(u2.latest.op, ChangeOp::Delete);
        assert!(u2.latest.payload.is_none());
        assert_eq!(wal.stats().total_written, 2);
    }

    #[tokio::test]
    async fn test_append_keeps_latest_sequence() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.db")).await.unwrap();

        wal.append(&set_entry("T:t9", "P2", 5)).await.unwrap();
        // Older event arriving late does not overwrite
        wal.append(&set_entry("T:t9", "P", 4)).await.unwrap();

        let pending = wal.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence(), 5);
        assert_eq!(pending[0].latest.payload.as_deref(), Some(b"P2".as_slice()));
    }

    #[tokio::test]
    async fn test_acknowledge_respects_newer_row() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.db")).await.unwrap();

        wal.append(&set_entry("T:t9", "P", 1)).await.unwrap();
        wal.append(&set_entry("T:t9", "P2", 2)).await.unwrap();

        // Ack of the superseded sequence leaves the newer row
        assert!(!wal.acknowledge("T:t9", 1).await.unwrap());
        assert_eq!(wal.count_pending().await.unwrap(), 1);

        assert!(wal.acknowledge("T:t9", 2).await.unwrap());
        assert_eq!(wal.count_pending().await.unwrap(), 0);
        assert_eq!(wal.stats().total_acked, 1);
    }

    #[tokio::test]
    async fn test_attempts_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.db");

        {
            let wal = WriteAheadLog::open(&path).await.unwrap();
            wal.append(&set_entry("UserEntity:u1", "{}", 7)).await.unwrap();
            wal.record_attempt("UserEntity:u1", 7, 3).await.unwrap();
            wal.close().await;
        }

        let wal = WriteAheadLog::open(&path).await.unwrap();
        let pending = wal.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt_count, 3);
        assert_eq!(pending[0].sequence(), 7);
    }

    #[tokio::test]
    async fn test_dead_letter_moves_row() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.db")).await.unwrap();

        let entry = set_entry("UserEntity:bad", "not json", 1);
        wal.append(&entry).await.unwrap();
        wal.dead_letter(&DeadLetter::new(entry, "poison", Some("expected value".into())))
            .await
            .unwrap();

        assert_eq!(wal.count_pending().await.unwrap(), 0);
        let letters = wal.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "poison");
        assert_eq!(letters[0].error.as_deref(), Some("expected value"));
        assert_eq!(letters[0].entry.cache_key, "UserEntity:bad");
        assert_eq!(wal.stats().total_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_on_empty_log() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.db")).await.unwrap();
        wal.checkpoint().await.unwrap();
        assert!(wal.path().ends_with("wal.db"));
    }
}
