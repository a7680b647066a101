// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records owned by the batch service, and the shapes the remote collector
//! hands back.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::Tier;
use crate::error::BatchError;
use crate::validate::{content_type_for, sanitize_filename};

const UNNAMED_BATCH: &str = "Unnamed Batch";

/// One batch file known for an organization.
///
/// `downloaded == true` is only ever persisted after the blob itself is in
/// the persistent store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub org_code: String,
    pub batch_name: String,
    pub filename: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub downloaded: bool,
    pub downloaded_at: Option<DateTime<Utc>>,
    /// SHA-256 hex of the stored blob
    pub content_hash: Option<String>,
    /// Raw upstream metadata, passed through untouched
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl BatchRecord {
    /// Build a fresh, not-yet-downloaded record from an upstream listing entry.
    ///
    /// Filenames are sanitized; missing names and types get defaults.
    #[must_use]
    pub fn from_remote(org_code: &str, remote: RemoteBatch, now: DateTime<Utc>) -> Self {
        let filename = remote
            .filename
            .as_deref()
            .map(sanitize_filename)
            .unwrap_or_else(|| format!("{}.pdf", remote.batch_id));
        let content_type = remote
            .content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| content_type_for(&filename));
        let batch_name = remote
            .batch_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNNAMED_BATCH.to_string());

        Self {
            batch_id: remote.batch_id,
            org_code: org_code.to_string(),
            batch_name,
            filename,
            size_bytes: remote.size_bytes.unwrap_or(0),
            content_type,
            created_at: remote.created_at.unwrap_or(now),
            downloaded: false,
            downloaded_at: None,
            content_hash: None,
            metadata: remote.metadata,
        }
    }

    /// Take listing fields from `incoming`, keep download state from `self`.
    ///
    /// A downloaded record also keeps its measured size, which is more
    /// trustworthy than whatever the listing claims.
    #[must_use]
    pub fn refreshed_with(&self, incoming: BatchRecord) -> BatchRecord {
        BatchRecord {
            downloaded: self.downloaded,
            downloaded_at: self.downloaded_at,
            content_hash: self.content_hash.clone(),
            size_bytes: if self.downloaded { self.size_bytes } else { incoming.size_bytes },
            created_at: self.created_at,
            ..incoming
        }
    }

    /// Record a completed download.
    pub fn mark_downloaded(&mut self, size_bytes: u64, content_hash: String, at: DateTime<Utc>) {
        self.size_bytes = size_bytes;
        self.content_hash = Some(content_hash);
        self.downloaded = true;
        self.downloaded_at = Some(at);
    }

    /// Persistent-store key of this batch's file bytes.
    #[must_use]
    pub fn blob_key(batch_id: &str) -> String {
        format!("blob/{batch_id}")
    }

    /// Persistent-store key of this record's JSON.
    #[must_use]
    pub fn record_key(batch_id: &str) -> String {
        format!("record/{batch_id}")
    }
}

/// Last-known listing for an organization. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgBatchSet {
    pub org_code: String,
    pub org_name: String,
    /// Upstream order is preserved
    pub batch_ids: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl OrgBatchSet {
    #[must_use]
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX));
        match self.fetched_at.checked_add_signed(ttl) {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

/// A listing as served to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchListing {
    pub set: OrgBatchSet,
    /// Records in `set.batch_ids` order
    pub batches: Vec<BatchRecord>,
    /// `true` when a refresh failed and this is the last-known listing
    pub stale: bool,
    /// Where the listing came from; `None` for a fresh remote fetch
    pub served_from: Option<Tier>,
}

/// One batch as reported by the remote collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub batch_id: String,
    #[serde(default)]
    pub batch_name: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RemoteBatch {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            ..Self::default()
        }
    }
}

/// An organization's listing as reported by the remote collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteListing {
    /// Falls back to the org code when absent
    pub org_name: Option<String>,
    pub batches: Vec<RemoteBatch>,
}

/// Raw file bytes from the remote collector.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Where a downloaded file's bytes were served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSource {
    Cache(Tier),
    /// The durable blob
    Storage,
    Remote,
}

/// A batch file and the record describing it.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
    pub record: BatchRecord,
    pub bytes: Vec<u8>,
    pub source: FileSource,
}

/// One file that could not be synchronized.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure {
    pub batch_id: String,
    pub error: BatchError,
}

/// Aggregate outcome of an org sync.
///
/// Files that were already downloaded count toward `downloaded_files` but
/// add nothing to `total_bytes`, which counts bytes transferred this run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub org_code: String,
    pub total_files: usize,
    pub downloaded_files: usize,
    pub failed_files: usize,
    /// Already downloaded, not fetched again
    pub skipped_files: usize,
    pub total_bytes: u64,
    pub duration: Duration,
    pub failures: Vec<SyncFailure>,
    /// The listing used was stale
    pub stale_listing: bool,
    /// The operation deadline cut the run short; unfinished files are in `failures`
    pub deadline_reached: bool,
}

impl SyncReport {
    #[must_use]
    pub fn progress_percentage(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        self.downloaded_files as f64 / self.total_files as f64 * 100.0
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.downloaded_files + self.failed_files >= self.total_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote(id: &str) -> RemoteBatch {
        RemoteBatch {
            batch_id: id.to_string(),
            batch_name: Some("Physics".into()),
            filename: Some("notes:ch1.pdf".into()),
            size_bytes: Some(2048),
            content_type: None,
            created_at: None,
            metadata: json!({"instructor": "R. Rao"}).as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_from_remote_applies_defaults() {
        let now = Utc::now();
        let record = BatchRecord::from_remote("ABC123", remote("b1"), now);

        assert_eq!(record.filename, "notes_ch1.pdf");
        assert_eq!(record.content_type, "application/pdf");
        assert_eq!(record.created_at, now);
        assert!(!record.downloaded);
        assert_eq!(record.metadata["instructor"], "R. Rao");

        let bare = BatchRecord::from_remote("ABC123", RemoteBatch::new("b2"), now);
        assert_eq!(bare.filename, "b2.pdf");
        assert_eq!(bare.batch_name, "Unnamed Batch");
        assert_eq!(bare.size_bytes, 0);
    }

    #[test]
    fn test_refresh_preserves_download_state() {
        let now = Utc::now();
        let mut existing = BatchRecord::from_remote("ABC123", remote("b1"), now);
        existing.mark_downloaded(4096, "abc".into(), now);

        let mut incoming_remote = remote("b1");
        incoming_remote.batch_name = Some("Physics (rev 2)".into());
        let incoming = BatchRecord::from_remote("ABC123", incoming_remote, now);

        let merged = existing.refreshed_with(incoming);
        assert!(merged.downloaded);
        assert_eq!(merged.downloaded_at, Some(now));
        assert_eq!(merged.size_bytes, 4096);
        assert_eq!(merged.content_hash.as_deref(), Some("abc"));
        assert_eq!(merged.batch_name, "Physics (rev 2)");
    }

    #[test]
    fn test_org_batch_set_freshness() {
        let now = Utc::now();
        let set = OrgBatchSet {
            org_code: "ABC123".into(),
            org_name: "ABC".into(),
            batch_ids: vec![],
            fetched_at: now - chrono::Duration::seconds(30),
            ttl_seconds: 60,
        };
        assert!(set.is_fresh_at(now));
        assert!(!set.is_fresh_at(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn test_sync_report_progress() {
        let report = SyncReport {
            total_files: 4,
            downloaded_files: 3,
            failed_files: 1,
            ..Default::default()
        };
        assert_eq!(report.progress_percentage(), 75.0);
        assert!(report.is_complete());
        assert_eq!(SyncReport::default().progress_percentage(), 0.0);
    }

    #[test]
    fn test_record_json_round_trip_keeps_metadata() {
        let record = BatchRecord::from_remote("ABC123", remote("b1"), Utc::now());
        let json = serde_json::to_string(&record).unwrap();
        let back: BatchRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
