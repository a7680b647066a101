// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use super::traits::{BlobHandle, PersistentStore, StorageError};

/// DashMap-backed [`PersistentStore`] for tests and single-process use.
///
/// Counts reads so tests can assert a faster tier absorbed a lookup.
pub struct InMemoryStore {
    data: DashMap<String, Vec<u8>>,
    reads: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            reads: AtomicU64::new(0),
        }
    }

    /// Get current blob count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of `get_blob` / `exists` calls served so far
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<BlobHandle, StorageError> {
        self.data.insert(key.to_string(), bytes.to_vec());
        Ok(BlobHandle::for_key(key))
    }

    async fn get_blob(&self, handle: &BlobHandle) -> Result<Option<Vec<u8>>, StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.get(handle.as_str()).map(|r| r.value().clone()))
    }

    async fn exists(&self, handle: &BlobHandle) -> Result<bool, StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.contains_key(handle.as_str()))
    }

    async fn delete_blob(&self, handle: &BlobHandle) -> Result<(), StorageError> {
        self.data.remove(handle.as_str());
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<BlobHandle>, StorageError> {
        let mut handles: Vec<BlobHandle> = self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| BlobHandle::for_key(r.key()))
            .collect();
        handles.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryStore::new();
        let handle = store.put_blob("blob/b1", b"hello").await.unwrap();

        assert_eq!(handle, BlobHandle::for_key("blob/b1"));
        assert_eq!(store.get_blob(&handle).await.unwrap().unwrap(), b"hello");
        assert!(store.exists(&handle).await.unwrap());
        assert_eq!(store.reads(), 2);
    }

    #[tokio::test]
    async fn test_get_nonexistent_returns_none() {
        let store = InMemoryStore::new();
        let result = store.get_blob(&BlobHandle::for_key("nope")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = InMemoryStore::new();
        store.put_blob("k", b"v1").await.unwrap();
        let handle = store.put_blob("k", b"v2").await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get_blob(&handle).await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let store = InMemoryStore::new();
        assert!(store.delete_blob(&BlobHandle::for_key("nope")).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_prefix_is_sorted_and_filtered() {
        let store = InMemoryStore::new();
        store.put_blob("record/b2", b"2").await.unwrap();
        store.put_blob("record/b1", b"1").await.unwrap();
        store.put_blob("blob/b1", b"x").await.unwrap();

        let handles = store.list_prefix("record/").await.unwrap();
        let keys: Vec<_> = handles.iter().map(BlobHandle::as_str).collect();
        assert_eq!(keys, vec!["record/b1", "record/b2"]);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store_clone
                        .put_blob(&format!("blob/{}-{}", batch, i), b"data")
                        .await
                        .unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
