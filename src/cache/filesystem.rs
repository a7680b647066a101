// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local filesystem cache tier.
//!
//! One file per key under `{root}/{kind}/`, holding an expiry envelope.
//! Writes go to a uniquely named temp file first and are renamed into place,
//! so a reader never sees a half-written value.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{decode_envelope, encode_envelope, CacheKey};
use crate::error::{BatchError, Result};

pub struct FilesystemTier {
    root: PathBuf,
}

impl FilesystemTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.kind.as_str()).join(key.file_name())
    }

    /// Read the entry for `key`, whatever its expiry. Corrupt files are deleted
    /// and reported as absent.
    pub async fn read(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, DateTime<Utc>)>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BatchError::storage("filesystem_read", e)),
        };

        match decode_envelope(&bytes) {
            Some((expires_at, value)) => Ok(Some((value.to_vec(), expires_at))),
            None => {
                warn!(path = %path.display(), "Discarding malformed cache file");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %e, "Could not remove malformed cache file");
                }
                Ok(None)
            }
        }
    }

    pub async fn write(&self, key: &CacheKey, value: &[u8], expires_at: DateTime<Utc>) -> Result<()> {
        let path = self.path_for(key);
        let dir = self.root.join(key.kind.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BatchError::storage("filesystem_mkdir", e))?;

        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let envelope = encode_envelope(expires_at, value);
        if let Err(e) = tokio::fs::write(&tmp, &envelope).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BatchError::storage("filesystem_write", e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BatchError::storage("filesystem_rename", e));
        }
        Ok(())
    }

    /// Removing a missing entry is not an error.
    pub async fn remove(&self, key: &CacheKey) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BatchError::storage("filesystem_remove", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FilesystemTier::new(dir.path());
        let key = CacheKey::file("b1");
        let expires_at = Utc::now() + Duration::seconds(60);

        tier.write(&key, b"%PDF-1.4", expires_at).await.unwrap();
        let (value, at) = tier.read(&key).await.unwrap().unwrap();

        assert_eq!(value, b"%PDF-1.4");
        assert_eq!(at.timestamp_millis(), expires_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_missing_key_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FilesystemTier::new(dir.path());
        assert!(tier.read(&CacheKey::file("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FilesystemTier::new(dir.path());
        let key = CacheKey::listing("ABC123");
        let expires_at = Utc::now() + Duration::seconds(60);

        tier.write(&key, b"v1", expires_at).await.unwrap();
        tier.write(&key, b"v2", expires_at).await.unwrap();

        assert_eq!(tier.read(&key).await.unwrap().unwrap().0, b"v2");
        let names: Vec<_> = std::fs::read_dir(dir.path().join("listing"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![key.file_name()]);
    }

    #[tokio::test]
    async fn test_malformed_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FilesystemTier::new(dir.path());
        let key = CacheKey::file("b1");

        let path = dir.path().join("file").join(key.file_name());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not an envelope").unwrap();

        assert!(tier.read(&key).await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FilesystemTier::new(dir.path());
        let key = CacheKey::file("b1");

        tier.write(&key, b"x", Utc::now()).await.unwrap();
        tier.remove(&key).await.unwrap();
        tier.remove(&key).await.unwrap();
        assert!(tier.read(&key).await.unwrap().is_none());
    }
}
