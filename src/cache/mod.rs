// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Three-tier read-through cache.
//!
//! ```text
//!            get                          put
//!             │                            │
//!             ▼                            ▼
//!   ┌──────────────────┐  promote  ┌──────────────────┐
//!   │  memory (DashMap) │◄─────────│   every tier     │
//!   └────────┬─────────┘           │  memory + fs     │ sync
//!            │ miss                │  persistent      │ sync | async | skip
//!   ┌────────▼─────────┐           └──────────────────┘
//!   │ filesystem (fs)   │
//!   └────────┬─────────┘
//!            │ miss
//!   ┌────────▼─────────┐
//!   │ persistent store  │
//!   └──────────────────┘
//! ```
//!
//! Every tier stores the absolute expiry alongside the value, so a value
//! promoted out of a slower tier keeps the TTL it had left, and no tier
//! ever answers with something past its `expires_at`.

pub mod filesystem;
pub mod manager;
pub mod memory;

pub use filesystem::FilesystemTier;
pub use manager::{CacheManager, PersistMode, WriteOptions};
pub use memory::MemoryTier;

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

/// One layer of the cache hierarchy, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Memory,
    Filesystem,
    Persistent,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::Filesystem => "filesystem",
            Tier::Persistent => "persistent",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a cache key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// An organization's batch listing
    Listing,
    /// A batch's file bytes
    File,
}

impl CacheKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Listing => "listing",
            CacheKind::File => "file",
        }
    }
}

/// Composite cache key: request kind plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub id: String,
}

impl CacheKey {
    pub fn listing(org_code: impl Into<String>) -> Self {
        Self { kind: CacheKind::Listing, id: org_code.into() }
    }

    pub fn file(batch_id: impl Into<String>) -> Self {
        Self { kind: CacheKind::File, id: batch_id.into() }
    }

    /// Key under which the persistent tier stores this entry.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("cache/{}/{}", self.kind.as_str(), self.id)
    }

    /// Filesystem-safe name, independent of what characters `id` holds.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.bin", hex::encode(self.id.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// A value served by the cache, and the tier that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: CacheKey,
    pub value: T,
    pub tier: Tier,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// TTL left at `now`, zero once expired.
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        remaining_ttl(self.expires_at, now)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            key: self.key,
            value: f(self.value),
            tier: self.tier,
            expires_at: self.expires_at,
        }
    }
}

pub(crate) fn remaining_ttl(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires_at - now).to_std().unwrap_or(Duration::ZERO)
}

pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ═══════════════════════════════════════════════════════════════════════════
// ENVELOPE - expiry header for the filesystem and persistent tiers
// ═══════════════════════════════════════════════════════════════════════════

const ENVELOPE_MAGIC: &[u8; 4] = b"BEC1";
const ENVELOPE_HEADER_LEN: usize = 12;

/// Prefix `value` with the magic and its expiry in epoch milliseconds.
#[must_use]
pub fn encode_envelope(expires_at: DateTime<Utc>, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + value.len());
    out.extend_from_slice(ENVELOPE_MAGIC);
    out.extend_from_slice(&expires_at.timestamp_millis().to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Split an envelope into expiry and value. `None` for anything malformed.
#[must_use]
pub fn decode_envelope(bytes: &[u8]) -> Option<(DateTime<Utc>, &[u8])> {
    if bytes.len() < ENVELOPE_HEADER_LEN || &bytes[..4] != ENVELOPE_MAGIC {
        return None;
    }
    let millis = i64::from_be_bytes(bytes[4..ENVELOPE_HEADER_LEN].try_into().ok()?);
    let expires_at = Utc.timestamp_millis_opt(millis).single()?;
    Some((expires_at, &bytes[ENVELOPE_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_keeps_expiry_to_the_millisecond() {
        let expires_at = Utc.timestamp_millis_opt(1_760_000_000_123).unwrap();
        let bytes = encode_envelope(expires_at, b"payload");

        let (decoded_at, value) = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded_at, expires_at);
        assert_eq!(value, b"payload");
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(decode_envelope(b"").is_none());
        assert!(decode_envelope(b"BEC1short").is_none());
        assert!(decode_envelope(b"XXXX\0\0\0\0\0\0\0\0payload").is_none());
    }

    #[test]
    fn test_empty_value_round_trips() {
        let expires_at = Utc::now();
        let bytes = encode_envelope(expires_at, b"");
        let (_, value) = decode_envelope(&bytes).unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn test_keys_are_namespaced_by_kind() {
        let listing = CacheKey::listing("ABC123");
        let file = CacheKey::file("ABC123");

        assert_ne!(listing, file);
        assert_eq!(listing.storage_key(), "cache/listing/ABC123");
        assert_eq!(file.storage_key(), "cache/file/ABC123");
        assert_eq!(listing.to_string(), "listing:ABC123");
    }

    #[test]
    fn test_file_name_hides_path_characters() {
        let key = CacheKey::file("../../etc/passwd");
        assert!(!key.file_name().contains('/'));
        assert!(!key.file_name().contains(".."));
    }

    #[test]
    fn test_remaining_ttl_saturates() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: CacheKey::listing("ABC"),
            value: (),
            tier: Tier::Memory,
            expires_at: now - chrono::Duration::seconds(5),
        };
        assert!(entry.is_expired_at(now));
        assert_eq!(entry.remaining_ttl(now), Duration::ZERO);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let at = expiry_after(Utc::now(), Duration::from_secs(u64::MAX));
        assert_eq!(at, DateTime::<Utc>::MAX_UTC);
    }
}
