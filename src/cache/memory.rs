// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache tier.
//!
//! DashMap shards give per-key exclusion, so a promotion racing a fresh
//! `put` on a different key never contends, and two writers to the same key
//! serialize on that key's shard. Sizes are tracked in an atomic so the
//! bound check never walks the map.
//!
//! Expired entries are not removed on read: a stale fallback may still want
//! them. They go when overwritten, swept, or evicted, and eviction always
//! takes the soonest-expiring entries first (expired ones before live ones).

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::CacheKey;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    #[inline]
    fn size(&self) -> usize {
        self.value.len()
    }
}

pub struct MemoryTier {
    entries: DashMap<CacheKey, MemoryEntry>,
    size_bytes: AtomicUsize,
    max_bytes: usize,
}

impl MemoryTier {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_bytes,
        }
    }

    /// Value and expiry, only if still live at `now`.
    #[must_use]
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<(Vec<u8>, DateTime<Utc>)> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= now {
            return None;
        }
        Some((entry.value.clone(), entry.expires_at))
    }

    /// Value and expiry regardless of expiry.
    #[must_use]
    pub fn get_stale(&self, key: &CacheKey) -> Option<(Vec<u8>, DateTime<Utc>)> {
        self.entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.expires_at))
    }

    /// Insert or replace. Returns `false` if the value alone exceeds the bound
    /// and was not cached.
    pub fn insert(&self, key: CacheKey, value: Vec<u8>, expires_at: DateTime<Utc>) -> bool {
        let entry = MemoryEntry { value, expires_at };
        let new_size = entry.size();

        if new_size > self.max_bytes {
            debug!(key = %key, size = new_size, max = self.max_bytes, "Value larger than memory tier, not cached");
            self.remove(&key);
            return false;
        }

        self.size_bytes.fetch_add(new_size, Ordering::AcqRel);
        if let Some(old) = self.entries.insert(key, entry) {
            self.size_bytes.fetch_sub(old.size(), Ordering::AcqRel);
        }

        self.maybe_evict();
        self.publish_gauges();
        true
    }

    /// Drop `key`. Returns whether it was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some((_, old)) => {
                self.size_bytes.fetch_sub(old.size(), Ordering::AcqRel);
                self.publish_gauges();
                true
            }
            None => false,
        }
    }

    /// Reclaim every entry expired at `now`. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        let mut removed_bytes = 0;
        for key in expired {
            // Re-check: a put may have refreshed it since the scan
            if let Some((_, old)) = self.entries.remove_if(&key, |_, e| e.expires_at <= now) {
                removed += 1;
                removed_bytes += old.size();
            }
        }

        if removed > 0 {
            self.size_bytes.fetch_sub(removed_bytes, Ordering::AcqRel);
            crate::metrics::record_eviction(removed, removed_bytes);
            self.publish_gauges();
            debug!(removed, removed_bytes, "Swept expired memory entries");
        }
        removed
    }

    fn maybe_evict(&self) {
        if self.size_bytes.load(Ordering::Acquire) <= self.max_bytes {
            return;
        }

        let mut candidates: Vec<(CacheKey, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().expires_at))
            .collect();
        candidates.sort_by_key(|(_, expires_at)| *expires_at);

        let mut evicted = 0;
        let mut evicted_bytes = 0;
        for (key, _) in candidates {
            if self.size_bytes.load(Ordering::Acquire) <= self.max_bytes {
                break;
            }
            if let Some((_, old)) = self.entries.remove(&key) {
                self.size_bytes.fetch_sub(old.size(), Ordering::AcqRel);
                evicted += 1;
                evicted_bytes += old.size();
            }
        }

        if evicted > 0 {
            crate::metrics::record_eviction(evicted, evicted_bytes);
            debug!(evicted, evicted_bytes, "Evicted soonest-expiring memory entries");
        }
    }

    fn publish_gauges(&self) {
        crate::metrics::set_memory_cache_items(self.entries.len());
        crate::metrics::set_memory_cache_bytes(self.size_bytes.load(Ordering::Acquire));
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently held
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}
