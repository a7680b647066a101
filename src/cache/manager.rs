// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier coordination: read-through with promotion, write-through with
//! caller-selected durability.
//!
//! The manager never calls the remote collector. A miss across every tier is
//! reported to the caller, which fetches and then writes the value back.
//!
//! # Example
//!
//! ```
//! use batch_engine::cache::{CacheKey, CacheManager, WriteOptions};
//! use batch_engine::storage::InMemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> batch_engine::Result<()> {
//! let cache = CacheManager::new(1024 * 1024, None, Arc::new(InMemoryStore::new()));
//! let key = CacheKey::listing("ABC123");
//!
//! cache.put(&key, b"listing", Duration::from_secs(60), WriteOptions::default()).await?;
//! assert_eq!(cache.get(&key).await.unwrap().value, b"listing");
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{decode_envelope, encode_envelope, expiry_after};
use super::{CacheEntry, CacheKey, FilesystemTier, MemoryTier, Tier};
use crate::error::{BatchError, Result};
use crate::storage::{BlobHandle, PersistentStore};

/// How a write reaches the persistent tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Do not write the persistent tier
    Skip,
    /// Fire-and-forget; failures are logged, never returned
    Async,
    /// Await the write; failures are returned
    Sync,
}

/// Which tiers a `put` writes to.
///
/// Memory and filesystem writes are always awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Default: `true`
    pub memory: bool,
    /// Default: `true` (ignored when no filesystem tier is configured)
    pub filesystem: bool,
    /// Default: [`PersistMode::Async`], a durability backstop
    pub persist: PersistMode,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            memory: true,
            filesystem: true,
            persist: PersistMode::Async,
        }
    }
}

impl WriteOptions {
    /// Memory and filesystem only. For values whose durable copy lives elsewhere.
    #[must_use]
    pub fn local_only() -> Self {
        Self {
            persist: PersistMode::Skip,
            ..Self::default()
        }
    }

    /// Every tier, persistent write awaited.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            persist: PersistMode::Sync,
            ..Self::default()
        }
    }
}

pub struct CacheManager {
    memory: Arc<MemoryTier>,
    filesystem: Option<FilesystemTier>,
    persistent: Arc<dyn PersistentStore>,
    /// Outstanding fire-and-forget persistent writes
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn new(
        memory_max_bytes: usize,
        cache_dir: Option<PathBuf>,
        persistent: Arc<dyn PersistentStore>,
    ) -> Self {
        Self {
            memory: Arc::new(MemoryTier::new(memory_max_bytes)),
            filesystem: cache_dir.map(FilesystemTier::new),
            persistent,
            pending: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    #[must_use]
    pub fn filesystem(&self) -> Option<&FilesystemTier> {
        self.filesystem.as_ref()
    }

    #[must_use]
    pub fn persistent(&self) -> &Arc<dyn PersistentStore> {
        &self.persistent
    }

    /// Look `key` up memory → filesystem → persistent.
    ///
    /// The first live hit is promoted into every faster tier with the same
    /// `expires_at`. Tier errors are logged and treated as misses.
    #[tracing::instrument(skip_all, fields(key = %key, tier))]
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry<Vec<u8>>> {
        let start = Instant::now();
        let now = Utc::now();

        // 1. Memory
        if let Some((value, expires_at)) = self.memory.get(key, now) {
            tracing::Span::current().record("tier", "memory");
            debug!("Memory hit");
            crate::metrics::record_cache_operation(Tier::Memory, "get", "hit");
            crate::metrics::record_latency("memory", "get", start.elapsed());
            return Some(self.entry(key, value, Tier::Memory, expires_at));
        }
        crate::metrics::record_cache_operation(Tier::Memory, "get", "miss");

        // 2. Filesystem
        if let Some(fs) = &self.filesystem {
            match fs.read(key).await {
                Ok(Some((value, expires_at))) if expires_at > now => {
                    self.memory.insert(key.clone(), value.clone(), expires_at);
                    tracing::Span::current().record("tier", "filesystem");
                    debug!("Filesystem hit, promoted to memory");
                    crate::metrics::record_cache_operation(Tier::Filesystem, "get", "hit");
                    crate::metrics::record_latency("filesystem", "get", start.elapsed());
                    return Some(self.entry(key, value, Tier::Filesystem, expires_at));
                }
                Ok(Some(_)) => {
                    debug!("Filesystem entry expired");
                    crate::metrics::record_cache_operation(Tier::Filesystem, "get", "expired");
                }
                Ok(None) => {
                    crate::metrics::record_cache_operation(Tier::Filesystem, "get", "miss");
                }
                Err(e) => {
                    warn!(error = %e, "Filesystem lookup failed");
                    crate::metrics::record_cache_operation(Tier::Filesystem, "get", "error");
                }
            }
        }

        // 3. Persistent
        match self.read_persistent(key).await {
            Ok(Some((value, expires_at))) if expires_at > now => {
                self.promote_to_filesystem(key, &value, expires_at).await;
                self.memory.insert(key.clone(), value.clone(), expires_at);
                tracing::Span::current().record("tier", "persistent");
                debug!("Persistent hit, promoted to faster tiers");
                crate::metrics::record_cache_operation(Tier::Persistent, "get", "hit");
                crate::metrics::record_latency("persistent", "get", start.elapsed());
                return Some(self.entry(key, value, Tier::Persistent, expires_at));
            }
            Ok(Some(_)) => {
                debug!("Persistent entry expired");
                crate::metrics::record_cache_operation(Tier::Persistent, "get", "expired");
            }
            Ok(None) => {
                crate::metrics::record_cache_operation(Tier::Persistent, "get", "miss");
            }
            Err(e) => {
                warn!(error = %e, "Persistent lookup failed");
                crate::metrics::record_cache_operation(Tier::Persistent, "get", "error");
            }
        }

        tracing::Span::current().record("tier", "miss");
        debug!("Cache miss");
        crate::metrics::record_latency("all", "get", start.elapsed());
        None
    }

    /// Find `key` in any tier, ignoring expiry. Never promotes.
    ///
    /// Used only to serve a last-known value when a refresh fails.
    pub async fn get_stale(&self, key: &CacheKey) -> Option<CacheEntry<Vec<u8>>> {
        if let Some((value, expires_at)) = self.memory.get_stale(key) {
            return Some(self.entry(key, value, Tier::Memory, expires_at));
        }
        if let Some(fs) = &self.filesystem {
            if let Ok(Some((value, expires_at))) = fs.read(key).await {
                return Some(self.entry(key, value, Tier::Filesystem, expires_at));
            }
        }
        match self.read_persistent(key).await {
            Ok(Some((value, expires_at))) => Some(self.entry(key, value, Tier::Persistent, expires_at)),
            _ => None,
        }
    }

    /// Write `value` to the tiers `opts` selects, expiring after `ttl`.
    #[tracing::instrument(skip_all, fields(key = %key, size = value.len(), ttl = ?ttl))]
    pub async fn put(&self, key: &CacheKey, value: &[u8], ttl: Duration, opts: WriteOptions) -> Result<()> {
        let expires_at = expiry_after(Utc::now(), ttl);

        if opts.memory {
            self.memory.insert(key.clone(), value.to_vec(), expires_at);
            crate::metrics::record_cache_operation(Tier::Memory, "put", "success");
        }

        if opts.filesystem {
            if let Some(fs) = &self.filesystem {
                if let Err(e) = fs.write(key, value, expires_at).await {
                    // Memory already holds the value; the filesystem copy is an optimisation
                    warn!(error = %e, "Filesystem cache write failed");
                    crate::metrics::record_cache_operation(Tier::Filesystem, "put", "error");
                } else {
                    crate::metrics::record_cache_operation(Tier::Filesystem, "put", "success");
                }
            }
        }

        match opts.persist {
            PersistMode::Skip => {}
            PersistMode::Sync => {
                let envelope = encode_envelope(expires_at, value);
                self.persistent
                    .put_blob(&key.storage_key(), &envelope)
                    .await
                    .map_err(|e| {
                        crate::metrics::record_cache_operation(Tier::Persistent, "put", "error");
                        BatchError::storage("cache_put", e)
                    })?;
                crate::metrics::record_cache_operation(Tier::Persistent, "put", "success");
            }
            PersistMode::Async => {
                let envelope = encode_envelope(expires_at, value);
                let store = self.persistent.clone();
                let storage_key = key.storage_key();
                let handle = tokio::spawn(async move {
                    match store.put_blob(&storage_key, &envelope).await {
                        Ok(_) => crate::metrics::record_cache_operation(Tier::Persistent, "put", "success"),
                        Err(e) => {
                            error!(key = %storage_key, error = %e, "Background persistent cache write failed");
                            crate::metrics::record_cache_operation(Tier::Persistent, "put", "error");
                        }
                    }
                });
                let mut pending = self.pending.lock();
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
        }

        Ok(())
    }

    /// Drop `key` from every tier.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.memory.remove(key);
        if let Some(fs) = &self.filesystem {
            fs.remove(key).await?;
        }
        // A queued background write would otherwise resurrect the key
        self.flush().await;
        self.persistent
            .delete_blob(&BlobHandle::for_key(&key.storage_key()))
            .await
            .map_err(|e| BatchError::storage("cache_invalidate", e))?;
        crate::metrics::record_cache_operation(Tier::Memory, "invalidate", "success");
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let entry = self.get(key).await?;
        Self::decode_json(entry)
    }

    pub async fn get_stale_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let entry = self.get_stale(key).await?;
        Self::decode_json(entry)
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
        opts: WriteOptions,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| BatchError::storage("cache_encode", e))?;
        self.put(key, &bytes, ttl, opts).await
    }

    /// Wait for every fire-and-forget persistent write issued so far.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pending.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background persistent cache write panicked");
            }
        }
    }

    /// Periodically reclaim expired memory entries until the returned handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let memory = self.memory.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                memory.sweep(Utc::now());
            }
        })
    }

    /// (items, bytes) held by the memory tier
    #[must_use]
    pub fn memory_stats(&self) -> (usize, usize) {
        (self.memory.len(), self.memory.size_bytes())
    }

    async fn read_persistent(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, DateTime<Utc>)>> {
        let handle = BlobHandle::for_key(&key.storage_key());
        let Some(bytes) = self.persistent.get_blob(&handle).await? else {
            return Ok(None);
        };
        match decode_envelope(&bytes) {
            Some((expires_at, value)) => Ok(Some((value.to_vec(), expires_at))),
            None => {
                warn!(handle = %handle, "Malformed persistent cache entry");
                Ok(None)
            }
        }
    }

    async fn promote_to_filesystem(&self, key: &CacheKey, value: &[u8], expires_at: DateTime<Utc>) {
        if let Some(fs) = &self.filesystem {
            if let Err(e) = fs.write(key, value, expires_at).await {
                warn!(error = %e, "Promotion to filesystem failed");
            }
        }
    }

    fn entry(&self, key: &CacheKey, value: Vec<u8>, tier: Tier, expires_at: DateTime<Utc>) -> CacheEntry<Vec<u8>> {
        CacheEntry {
            key: key.clone(),
            value,
            tier,
            expires_at,
        }
    }

    fn decode_json<T: DeserializeOwned>(entry: CacheEntry<Vec<u8>>) -> Option<CacheEntry<T>> {
        match serde_json::from_slice::<T>(&entry.value) {
            Ok(value) => Some(CacheEntry {
                key: entry.key,
                value,
                tier: entry.tier,
                expires_at: entry.expires_at,
            }),
            Err(e) => {
                warn!(key = %entry.key, tier = %entry.tier, error = %e, "Undecodable cache entry");
                None
            }
        }
    }
}
