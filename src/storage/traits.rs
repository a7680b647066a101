// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
}

/// Opaque reference to a stored blob.
///
/// Handles are derived from the key the blob was stored under, so a caller
/// that knows the key can address the blob without a lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(String);

impl BlobHandle {
    #[must_use]
    pub fn for_key(key: &str) -> Self {
        Self(key.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable blob storage: the slowest cache tier and the ground truth for
/// downloaded batch files and their records.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous blob.
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<BlobHandle, StorageError>;

    /// Fetch a blob. `Ok(None)` when the handle is unknown.
    async fn get_blob(&self, handle: &BlobHandle) -> Result<Option<Vec<u8>>, StorageError>;

    async fn exists(&self, handle: &BlobHandle) -> Result<bool, StorageError>;

    /// Remove a blob. Deleting an unknown handle is not an error.
    async fn delete_blob(&self, handle: &BlobHandle) -> Result<(), StorageError>;

    /// List handles whose key starts with `prefix`.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<BlobHandle>, StorageError>;
}
