// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Larger persistent tier backed by SQLite through sqlx's `Any` driver.
//!
//! ```sql
//! CREATE TABLE batch_vault_entries (
//!   entry_key  TEXT PRIMARY KEY,
//!   payload    TEXT NOT NULL,     -- serialized JSON
//!   size_bytes INTEGER NOT NULL,  -- payload length, used for quota
//!   updated_at INTEGER NOT NULL   -- epoch millis, used for cleanup
//! )
//! ```
//!
//! The column is `entry_key` rather than `key` so the same DDL stays valid
//! on engines where `KEY` is reserved.

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::traits::{payload_size, BackendKind, StorageBackend, StorageError, StorageQuota};
use crate::config::BulkLocalConfig;
use crate::platform::Platform;
use crate::resilience::retry::{RetryManager, RetryPolicy};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Lock contention and connection trouble are worth retrying; anything
/// else (bad SQL, constraint violations) is not.
fn sql_error(err: sqlx::Error) -> StorageError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    };
    if transient {
        StorageError::TransientIo {
            backend: BackendKind::BulkLocal,
            message: err.to_string(),
        }
    } else {
        StorageError::Backend(format!("bulk-local: {err}"))
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub struct BulkLocalStore {
    pool: AnyPool,
    config: BulkLocalConfig,
    platform: Arc<dyn Platform>,
    retry: RetryManager,
    /// Serializes the capacity check with the write it guards
    write_lock: Mutex<()>,
}

impl BulkLocalStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn open(config: BulkLocalConfig, platform: Arc<dyn Platform>) -> Result<Self, StorageError> {
        install_drivers();

        // Every connection to an in-memory database sees its own empty database
        let max_connections = if is_memory_url(&config.url) { 1 } else { config.max_connections };
        let startup = RetryManager::new(RetryPolicy::startup());
        let url = config.url.clone();
        let pool = startup
            .execute_with_retry("bulk_local_connect", &url, || async {
                AnyPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(&url)
                    .await
                    .map_err(sql_error)
            })
            .await?;

        let store = Self {
            pool,
            config,
            platform,
            retry: RetryManager::new(RetryPolicy::query()),
            write_lock: Mutex::new(()),
        };

        if !is_memory_url(&store.config.url) {
            store.enable_wal_mode().await?;
        }
        store.init_schema(&startup).await?;
        info!(max_connections, "Bulk-local store opened");
        Ok(store)
    }

    /// Concurrent reads during writes, single fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(())
    }

    async fn init_schema(&self, startup: &RetryManager) -> Result<(), StorageError> {
        startup
            .execute_with_retry("bulk_local_init_schema", "batch_vault_entries", || async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS batch_vault_entries (
                        entry_key TEXT PRIMARY KEY,
                        payload TEXT NOT NULL,
                        size_bytes INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(sql_error)?;
                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_batch_vault_updated_at ON batch_vault_entries (updated_at)",
                )
                .execute(&self.pool)
                .await
                .map_err(sql_error)?;
                Ok(())
            })
            .await
    }

    /// Close the pool. Later calls fail with a transient error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn used_bytes_excluding(&self, key: &str) -> Result<u64, StorageError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(size_bytes), 0) AS used FROM batch_vault_entries WHERE entry_key <> ?",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(sql_error)?;
        let used: i64 = row.try_get("used").map_err(sql_error)?;
        Ok(used.max(0) as u64)
    }
}

#[async_trait]
impl StorageBackend for BulkLocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::BulkLocal
    }

    async fn is_available(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.retry
            .execute_with_retry("bulk_local_get", key, || async {
                let row = sqlx::query("SELECT payload FROM batch_vault_entries WHERE entry_key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(sql_error)?;

                let Some(row) = row else {
                    return Ok(None);
                };
                // TEXT may come back as bytes through the Any driver
                let payload: String = row
                    .try_get::<String, _>("payload")
                    .or_else(|_| {
                        row.try_get::<Vec<u8>, _>("payload")
                            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    })
                    .map_err(sql_error)?;
                Ok(Some(serde_json::from_str(&payload)?))
            })
            .await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let payload = serde_json::to_string(value)?;
        let size = payload_size(value)?;
        if size > self.config.max_item_bytes {
            return Err(StorageError::CapacityExceeded {
                backend: BackendKind::BulkLocal,
                requested: size,
                limit: self.config.max_item_bytes,
            });
        }

        let _guard = self.write_lock.lock().await;
        let used = self.used_bytes_excluding(key).await?;
        if used + size > self.config.max_size_bytes {
            return Err(StorageError::CapacityExceeded {
                backend: BackendKind::BulkLocal,
                requested: size,
                limit: self.config.max_size_bytes.saturating_sub(used),
            });
        }

        let now = self.platform.now_millis();
        self.retry
            .execute_with_retry("bulk_local_set", key, || async {
                sqlx::query(
                    "INSERT INTO batch_vault_entries (entry_key, payload, size_bytes, updated_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(entry_key) DO UPDATE SET
                        payload = excluded.payload,
                        size_bytes = excluded.size_bytes,
                        updated_at = excluded.updated_at",
                )
                .bind(key)
                .bind(&payload)
                .bind(size as i64)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(sql_error)?;
                Ok(())
            })
            .await?;
        crate::metrics::record_bytes_written(BackendKind::BulkLocal.as_str(), size);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.retry
            .execute_with_retry("bulk_local_remove", key, || async {
                sqlx::query("DELETE FROM batch_vault_entries WHERE entry_key = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await
                    .map_err(sql_error)?;
                Ok(())
            })
            .await
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT entry_key FROM batch_vault_entries ORDER BY entry_key")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_error)?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(row.try_get::<String, _>("entry_key").map_err(sql_error)?);
        }
        Ok(keys)
    }

    async fn quota(&self) -> Result<StorageQuota, StorageError> {
        let row = sqlx::query("SELECT COALESCE(SUM(size_bytes), 0) AS used FROM batch_vault_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(sql_error)?;
        let used: i64 = row.try_get("used").map_err(sql_error)?;
        Ok(StorageQuota {
            max_size: self.config.max_size_bytes,
            warning_threshold: self.config.warning_threshold,
            used: used.max(0) as u64,
        })
    }

    async fn cleanup(&self) -> Result<usize, StorageError> {
        let cutoff = self.platform.now_millis() - self.config.max_age_ms as i64;
        let result = sqlx::query("DELETE FROM batch_vault_entries WHERE updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        let removed = result.rows_affected() as usize;
        if removed > 0 {
            debug!(removed, "Bulk-local cleanup removed stale entries");
            crate::metrics::record_reclaimed(BackendKind::BulkLocal.as_str(), removed);
        }
        Ok(removed)
    }
}
