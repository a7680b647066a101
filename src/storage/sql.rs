// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed chunked blob store.
//!
//! Blobs are split into fixed-size chunks so large batch files never have to
//! fit in a single row (MySQL `max_allowed_packet`, SQLite page churn):
//!
//! ```sql
//! CREATE TABLE blobs (
//!   handle VARCHAR(255) PRIMARY KEY,
//!   size_bytes BIGINT NOT NULL,
//!   chunk_count BIGINT NOT NULL,
//!   created_at BIGINT NOT NULL     -- epoch millis
//! );
//! CREATE TABLE blob_chunks (
//!   handle VARCHAR(255) NOT NULL,
//!   idx BIGINT NOT NULL,
//!   data MEDIUMBLOB NOT NULL,
//!   PRIMARY KEY (handle, idx)
//! );
//! ```
//!
//! A `put_blob` replaces header and chunks inside one transaction, so readers
//! see either the old blob or the new one.

use async_trait::async_trait;
use sqlx::{AnyPool, Row, any::AnyPoolOptions};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;

use super::traits::{BlobHandle, PersistentStore, StorageError};
use crate::resilience::retry::{retry, RetryPolicy};

/// Chunk size for blob rows (fits comfortably in a MEDIUMBLOB).
pub const CHUNK_SIZE: usize = 256 * 1024;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlBlobStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlBlobStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    ///
    /// `sqlite::memory:` is pinned to a single long-lived connection, since
    /// every SQLite memory connection is its own database.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let is_memory = is_sqlite && connection_string.contains(":memory:");

        let pool = retry("sql_connect", &RetryPolicy::startup(), || async {
            let options = if is_memory {
                AnyPoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
            } else {
                AnyPoolOptions::new()
                    .max_connections(20)
                    .idle_timeout(Duration::from_secs(300))
            };
            options
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite && !is_memory {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 2] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS blobs (
                    handle TEXT PRIMARY KEY,
                    size_bytes INTEGER NOT NULL,
                    chunk_count INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS blob_chunks (
                    handle TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    PRIMARY KEY (handle, idx)
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS blobs (
                    handle VARCHAR(255) PRIMARY KEY,
                    size_bytes BIGINT NOT NULL,
                    chunk_count BIGINT NOT NULL,
                    created_at BIGINT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS blob_chunks (
                    handle VARCHAR(255) NOT NULL,
                    idx BIGINT NOT NULL,
                    data MEDIUMBLOB NOT NULL,
                    PRIMARY KEY (handle, idx)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryPolicy::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    async fn write_blob(&self, handle: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            Vec::new()
        } else {
            bytes.chunks(CHUNK_SIZE).collect()
        };
        let created_at = chrono::Utc::now().timestamp_millis();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query("DELETE FROM blob_chunks WHERE handle = ?")
            .bind(handle)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query("DELETE FROM blobs WHERE handle = ?")
            .bind(handle)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query("INSERT INTO blobs (handle, size_bytes, chunk_count, created_at) VALUES (?, ?, ?, ?)")
            .bind(handle)
            .bind(bytes.len() as i64)
            .bind(chunks.len() as i64)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        for (idx, chunk) in chunks.iter().enumerate() {
            sqlx::query("INSERT INTO blob_chunks (handle, idx, data) VALUES (?, ?, ?)")
                .bind(handle)
                .bind(idx as i64)
                .bind(chunk.to_vec())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        debug!(handle, size = bytes.len(), chunks = chunks.len(), "Blob written");
        Ok(())
    }

    async fn read_blob(&self, handle: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let header = sqlx::query("SELECT size_bytes, chunk_count FROM blobs WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let Some(header) = header else {
            return Ok(None);
        };
        let size: i64 = header
            .try_get("size_bytes")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let chunk_count: i64 = header
            .try_get("chunk_count")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows = sqlx::query("SELECT data FROM blob_chunks WHERE handle = ? ORDER BY idx")
            .bind(handle)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        if rows.len() as i64 != chunk_count {
            return Err(StorageError::Corruption {
                id: handle.to_string(),
                expected: format!("{} chunks", chunk_count),
                actual: format!("{} chunks", rows.len()),
            });
        }

        let mut data = Vec::with_capacity(size.max(0) as usize);
        for row in rows {
            let chunk: Vec<u8> = row
                .try_get("data")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            data.extend_from_slice(&chunk);
        }

        if data.len() as i64 != size {
            return Err(StorageError::Corruption {
                id: handle.to_string(),
                expected: format!("{} bytes", size),
                actual: format!("{} bytes", data.len()),
            });
        }

        Ok(Some(data))
    }
}

#[async_trait]
impl PersistentStore for SqlBlobStore {
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<BlobHandle, StorageError> {
        retry("sql_put_blob", &RetryPolicy::query(), || self.write_blob(key, bytes)).await?;
        Ok(BlobHandle::for_key(key))
    }

    async fn get_blob(&self, handle: &BlobHandle) -> Result<Option<Vec<u8>>, StorageError> {
        retry("sql_get_blob", &RetryPolicy::query(), || self.read_blob(handle.as_str())).await
    }

    async fn exists(&self, handle: &BlobHandle) -> Result<bool, StorageError> {
        retry("sql_exists", &RetryPolicy::query(), || async {
            let result = sqlx::query("SELECT 1 FROM blobs WHERE handle = ? LIMIT 1")
                .bind(handle.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.is_some())
        })
        .await
    }

    async fn delete_blob(&self, handle: &BlobHandle) -> Result<(), StorageError> {
        retry("sql_delete_blob", &RetryPolicy::query(), || async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            sqlx::query("DELETE FROM blob_chunks WHERE handle = ?")
                .bind(handle.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            sqlx::query("DELETE FROM blobs WHERE handle = ?")
                .bind(handle.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            tx.commit()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<BlobHandle>, StorageError> {
        // SUBSTR instead of LIKE: batch ids may contain `_`, a LIKE wildcard.
        let prefix_len = prefix.chars().count() as i64;
        retry("sql_list_prefix", &RetryPolicy::query(), || async {
            let rows = sqlx::query("SELECT handle FROM blobs WHERE SUBSTR(handle, 1, ?) = ? ORDER BY handle")
                .bind(prefix_len)
                .bind(prefix)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| {
                    row.try_get::<String, _>("handle")
                        .or_else(|_| {
                            row.try_get::<Vec<u8>, _>("handle")
                                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                        })
                        .map(|h| BlobHandle::for_key(&h))
                        .map_err(|e| StorageError::Backend(e.to_string()))
                })
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlBlobStore {
        SqlBlobStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_spans_chunks() {
        let store = memory_store().await;
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();

        let handle = store.put_blob("blob/big", &data).await.unwrap();
        let read = store.get_blob(&handle).await.unwrap().unwrap();

        assert_eq!(read.len(), data.len());
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_empty_blob() {
        let store = memory_store().await;
        let handle = store.put_blob("blob/empty", b"").await.unwrap();
        assert_eq!(store.get_blob(&handle).await.unwrap().unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_put_replaces_previous_chunks() {
        let store = memory_store().await;
        let big = vec![7u8; CHUNK_SIZE + 1];
        store.put_blob("blob/x", &big).await.unwrap();
        let handle = store.put_blob("blob/x", b"small").await.unwrap();

        assert_eq!(store.get_blob(&handle).await.unwrap().unwrap(), b"small");
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let store = memory_store().await;
        let handle = store.put_blob("record/b1", b"{}").await.unwrap();
        assert!(store.exists(&handle).await.unwrap());

        store.delete_blob(&handle).await.unwrap();
        assert!(!store.exists(&handle).await.unwrap());
        assert!(store.get_blob(&handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_treats_underscore_literally() {
        let store = memory_store().await;
        store.put_blob("record/batch_1", b"a").await.unwrap();
        store.put_blob("record/batchX1", b"b").await.unwrap();
        store.put_blob("blob/batch_1", b"c").await.unwrap();

        let handles = store.list_prefix("record/batch_").await.unwrap();
        assert_eq!(handles, vec![BlobHandle::for_key("record/batch_1")]);
    }
}
