// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch orchestration: listing, download and org-wide sync.
//!
//! # Remote fetch path
//!
//! ```text
//! request ──► cache tiers ──hit──► caller
//!                 │ miss
//!                 ▼
//!           SingleFlight(key) ──joined──► shared result
//!                 │ leader
//!                 ▼
//!        retry::execute ─┬─► RateLimiter::acquire ─► RemoteCollector
//!                        └─ (each attempt takes a fresh token)
//!                 │ ok
//!                 ▼
//!   persistent store (blob, then record) ──► index ──► memory / fs tiers
//! ```
//!
//! The durable write always lands before the in-memory index and the fast
//! cache tiers learn about it, so no faster tier can claim a download the
//! persistent store does not hold.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheManager, WriteOptions};
use crate::config::BatchEngineConfig;
use crate::error::{BatchError, Result};
use crate::model::{
    BatchListing, BatchRecord, DownloadedFile, FileSource, OrgBatchSet, RemoteListing, RemotePayload,
    SyncFailure, SyncReport,
};
use crate::remote::RemoteCollector;
use crate::resilience::retry::{self, RetryPolicy};
use crate::resilience::{RateLimiter, SingleFlight};
use crate::storage::{BlobHandle, PersistentStore};
use crate::validate::{validate_batch_id, validate_org_code};

/// Orchestrates cache, gating and the remote collector.
///
/// Cheap to clone: every field is shared.
#[derive(Clone)]
pub struct BatchService {
    config: Arc<BatchEngineConfig>,
    remote: Arc<dyn RemoteCollector>,
    store: Arc<dyn PersistentStore>,
    cache: Arc<CacheManager>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    /// batch_id → record, mirroring `record/{batch_id}` in the store
    records: Arc<DashMap<String, BatchRecord>>,
    /// Serializes read-modify-write of one record
    record_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    listings: Arc<SingleFlight<String, BatchListing>>,
    downloads: Arc<SingleFlight<String, DownloadedFile>>,
}

impl BatchService {
    pub fn new(
        config: BatchEngineConfig,
        remote: Arc<dyn RemoteCollector>,
        store: Arc<dyn PersistentStore>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = CacheManager::new(config.memory_max_bytes, config.cache_dir.clone(), store.clone());
        Ok(Self {
            limiter: Arc::new(config.rate_limiter()),
            retry: config.retry_policy(),
            config: Arc::new(config),
            remote,
            store,
            cache: Arc::new(cache),
            records: Arc::new(DashMap::new()),
            record_locks: Arc::new(DashMap::new()),
            listings: Arc::new(SingleFlight::new()),
            downloads: Arc::new(SingleFlight::new()),
        })
    }

    /// Replace the retry policy built from config.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    #[must_use]
    pub fn config(&self) -> &BatchEngineConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Start the memory sweeper if `sweep_interval_secs` is set.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        self.config
            .sweep_interval()
            .map(|interval| self.cache.spawn_sweeper(interval))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LISTING
    // ═══════════════════════════════════════════════════════════════════════

    /// Batches for `org_code`, from cache unless `force_refresh`.
    ///
    /// When a refresh fails for any reason other than an unknown org, and
    /// `serve_stale_on_error` is set, the last-known listing is returned with
    /// `stale = true`.
    #[tracing::instrument(skip(self))]
    pub async fn list_batches(&self, org_code: &str, force_refresh: bool) -> Result<BatchListing> {
        validate_org_code(org_code)?;
        let key = CacheKey::listing(org_code);

        if !force_refresh {
            if let Some(entry) = self.cache.get_json::<OrgBatchSet>(&key).await {
                let batches = self.records_for(&entry.value).await?;
                debug!(tier = %entry.tier, count = batches.len(), "Listing served from cache");
                return Ok(BatchListing {
                    set: entry.value,
                    batches,
                    stale: false,
                    served_from: Some(entry.tier),
                });
            }
        }

        let this = self.clone();
        let org = org_code.to_string();
        let result = self
            .listings
            .run(format!("list:{org_code}"), move || async move { this.refresh_listing(&org).await })
            .await;

        match result {
            Ok(listing) => Ok(listing),
            Err(err) if self.config.serve_stale_on_error && !matches!(err, BatchError::OrgCodeNotFound { .. }) => {
                let Some(entry) = self.cache.get_stale_json::<OrgBatchSet>(&key).await else {
                    return Err(err);
                };
                warn!(error = %err, fetched_at = %entry.value.fetched_at, "Refresh failed, serving stale listing");
                crate::metrics::record_stale_served(org_code);
                let batches = self.records_for(&entry.value).await?;
                Ok(BatchListing {
                    set: entry.value,
                    batches,
                    stale: true,
                    served_from: Some(entry.tier),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn refresh_listing(&self, org_code: &str) -> Result<BatchListing> {
        crate::metrics::set_in_flight_fetches(self.listings.in_flight() + self.downloads.in_flight());
        let start = Instant::now();
        let listing = self.fetch_listing(org_code).await?;
        let now = Utc::now();

        let org_name = listing
            .org_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| org_code.to_string());

        let mut batch_ids: Vec<String> = Vec::with_capacity(listing.batches.len());
        let mut batches = Vec::with_capacity(listing.batches.len());
        for remote in listing.batches {
            if let Err(e) = validate_batch_id(&remote.batch_id) {
                warn!(batch_id = %remote.batch_id, error = %e, "Skipping batch with malformed id");
                continue;
            }
            if batch_ids.contains(&remote.batch_id) {
                debug!(batch_id = %remote.batch_id, "Duplicate batch in listing");
                continue;
            }
            let incoming = BatchRecord::from_remote(org_code, remote, now);
            batch_ids.push(incoming.batch_id.clone());
            batches.push(self.upsert_listed(incoming).await?);
        }

        let set = OrgBatchSet {
            org_code: org_code.to_string(),
            org_name,
            batch_ids,
            fetched_at: now,
            ttl_seconds: self.config.cache_ttl_secs,
        };
        self.cache
            .put_json(&CacheKey::listing(org_code), &set, self.config.cache_ttl(), WriteOptions::default())
            .await?;

        crate::metrics::record_latency("remote", "list", start.elapsed());
        info!(org_code, batch_count = batches.len(), "Fetched batch listing");
        Ok(BatchListing {
            set,
            batches,
            stale: false,
            served_from: None,
        })
    }

    async fn fetch_listing(&self, org_code: &str) -> Result<RemoteListing> {
        let remote = &self.remote;
        let limiter = &self.limiter;
        retry::execute("fetch_org_listing", &self.retry, move || async move {
            limiter.acquire().await;
            let result = remote.fetch_org_listing(org_code).await;
            crate::metrics::record_remote_call("fetch_org_listing", result.is_ok());
            result
        })
        .await
    }

    /// Merge a listed record with what is already known, keeping download state.
    async fn upsert_listed(&self, incoming: BatchRecord) -> Result<BatchRecord> {
        let lock = self.record_lock(&incoming.batch_id);
        let _guard = lock.lock().await;

        let existing = self.load_record(&incoming.batch_id).await?;
        let merged = match &existing {
            Some(existing) => existing.refreshed_with(incoming),
            None => incoming,
        };
        if existing.as_ref() != Some(&merged) {
            self.persist_record(&merged).await?;
        }
        Ok(merged)
    }

    async fn records_for(&self, set: &OrgBatchSet) -> Result<Vec<BatchRecord>> {
        let mut records = Vec::with_capacity(set.batch_ids.len());
        for batch_id in &set.batch_ids {
            match self.load_record(batch_id).await? {
                Some(record) => records.push(record),
                None => warn!(batch_id = %batch_id, org_code = %set.org_code, "Listed batch has no record"),
            }
        }
        Ok(records)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DOWNLOAD
    // ═══════════════════════════════════════════════════════════════════════

    /// One batch's file: cache, then the durable blob, then the remote.
    pub async fn download_batch(&self, batch_id: &str, org_code: &str) -> Result<DownloadedFile> {
        self.download_batch_with(batch_id, org_code, false).await
    }

    /// Like [`download_batch`](Self::download_batch); `force` skips every
    /// local copy and fetches from the remote again.
    #[tracing::instrument(skip(self))]
    pub async fn download_batch_with(&self, batch_id: &str, org_code: &str, force: bool) -> Result<DownloadedFile> {
        validate_batch_id(batch_id)?;
        validate_org_code(org_code)?;

        let record = self.resolve_record(batch_id, org_code).await?;

        if !force {
            if let Some(file) = self.read_local(&record).await? {
                return Ok(file);
            }
        }

        let this = self.clone();
        self.downloads
            .run(format!("blob:{batch_id}"), move || async move { this.fetch_and_store(record).await })
            .await
    }

    /// Find the record for `batch_id` under `org_code`, listing the org once
    /// if the id is not known yet.
    async fn resolve_record(&self, batch_id: &str, org_code: &str) -> Result<BatchRecord> {
        if let Some(record) = self.load_record(batch_id).await?.filter(|r| r.org_code == org_code) {
            return Ok(record);
        }

        debug!(batch_id, org_code, "Unknown batch, consulting org listing");
        let listing = self.list_batches(org_code, false).await?;
        listing
            .batches
            .into_iter()
            .find(|r| r.batch_id == batch_id)
            .ok_or_else(|| BatchError::batch_not_found(batch_id, Some(org_code)))
    }

    /// Serve a downloaded record's bytes without the remote, if any local copy
    /// is intact.
    async fn read_local(&self, record: &BatchRecord) -> Result<Option<DownloadedFile>> {
        if !record.downloaded {
            return Ok(None);
        }

        let key = CacheKey::file(&record.batch_id);
        if let Some(entry) = self.cache.get(&key).await {
            if verify_hash(record, &entry.value) {
                return Ok(Some(DownloadedFile {
                    record: record.clone(),
                    bytes: entry.value,
                    source: FileSource::Cache(entry.tier),
                }));
            }
            self.cache.invalidate(&key).await?;
        }

        match self.read_blob(record).await? {
            Some(bytes) => {
                self.cache
                    .put(&key, &bytes, self.config.cache_ttl(), WriteOptions::local_only())
                    .await?;
                debug!(batch_id = %record.batch_id, "Served from persistent store");
                Ok(Some(DownloadedFile {
                    record: record.clone(),
                    bytes,
                    source: FileSource::Storage,
                }))
            }
            None => {
                warn!(batch_id = %record.batch_id, "Record marked downloaded but blob is unusable, fetching again");
                Ok(None)
            }
        }
    }

    /// The durable blob, if present and matching the record's hash.
    async fn read_blob(&self, record: &BatchRecord) -> Result<Option<Vec<u8>>> {
        let handle = BlobHandle::for_key(&BatchRecord::blob_key(&record.batch_id));
        let bytes = self
            .store
            .get_blob(&handle)
            .await
            .map_err(|e| BatchError::storage("get_blob", e))?;
        Ok(bytes.filter(|bytes| verify_hash(record, bytes)))
    }

    async fn fetch_and_store(&self, record: BatchRecord) -> Result<DownloadedFile> {
        crate::metrics::set_in_flight_fetches(self.listings.in_flight() + self.downloads.in_flight());
        let start = Instant::now();
        let batch_id = record.batch_id.clone();
        let payload = self.fetch_bytes(&batch_id).await?;

        if payload.bytes.is_empty() {
            return Err(BatchError::DownloadFailed {
                target: batch_id,
                reason: "Empty file content".to_string(),
                attempts: 1,
            });
        }
        let size = payload.bytes.len() as u64;
        if size > self.config.max_file_size_bytes {
            return Err(BatchError::DownloadFailed {
                target: batch_id,
                reason: format!("file size {size} exceeds limit of {} bytes", self.config.max_file_size_bytes),
                attempts: 1,
            });
        }

        let content_hash = hex::encode(Sha256::digest(&payload.bytes));

        // Durable first: blob, then the record that points at it
        self.store
            .put_blob(&BatchRecord::blob_key(&batch_id), &payload.bytes)
            .await
            .map_err(|e| BatchError::storage("put_blob", e))?;

        let updated = {
            let lock = self.record_lock(&batch_id);
            let _guard = lock.lock().await;
            // A listing refresh may have touched the record while we were fetching
            let mut latest = self.load_record(&batch_id).await?.unwrap_or(record);
            latest.mark_downloaded(size, content_hash, Utc::now());
            if let Some(content_type) = payload.content_type.filter(|ct| !ct.trim().is_empty()) {
                latest.content_type = content_type;
            }
            self.persist_record(&latest).await?;
            latest
        };

        self.cache
            .put(&CacheKey::file(&batch_id), &payload.bytes, self.config.cache_ttl(), WriteOptions::local_only())
            .await?;

        crate::metrics::record_bytes_downloaded(payload.bytes.len());
        crate::metrics::record_latency("remote", "download", start.elapsed());
        info!(batch_id = %batch_id, filename = %updated.filename, size, "Downloaded batch file");

        Ok(DownloadedFile {
            record: updated,
            bytes: payload.bytes,
            source: FileSource::Remote,
        })
    }

    async fn fetch_bytes(&self, batch_id: &str) -> Result<RemotePayload> {
        let remote = &self.remote;
        let limiter = &self.limiter;
        retry::execute("fetch_batch_bytes", &self.retry, move || async move {
            limiter.acquire().await;
            let result = remote.fetch_batch_bytes(batch_id).await;
            crate::metrics::record_remote_call("fetch_batch_bytes", result.is_ok());
            result
        })
        .await
        .map_err(|err| match err {
            BatchError::DownloadFailed { reason, attempts, .. } => BatchError::DownloadFailed {
                target: batch_id.to_string(),
                reason,
                attempts,
            },
            other => other,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SYNC
    // ═══════════════════════════════════════════════════════════════════════

    /// Make sure every batch of `org_code` is downloaded.
    ///
    /// Files are fetched by up to `sync_concurrency` workers. A file that
    /// fails is recorded in the report and does not stop the others; only a
    /// failure to list the org fails the whole operation.
    ///
    /// The configured operation deadline applies to the run as a whole. Once
    /// it passes no new file is started, in-flight files are abandoned, and
    /// each unfinished file is reported as a `Timeout` failure alongside the
    /// files that did complete.
    #[tracing::instrument(skip(self))]
    pub async fn sync_org_batches(&self, org_code: &str, force_refresh: bool) -> Result<SyncReport> {
        let start = Instant::now();
        let deadline = self
            .config
            .operation_timeout()
            .map(|after| (tokio::time::Instant::now() + after, after));
        let listing = within(deadline, "sync_org_batches", self.list_batches(org_code, force_refresh)).await?;

        let mut report = SyncReport {
            org_code: org_code.to_string(),
            total_files: listing.batches.len(),
            stale_listing: listing.stale,
            ..Default::default()
        };

        let workers = Arc::new(Semaphore::new(self.config.sync_concurrency.max(1)));
        let mut tasks: JoinSet<(String, Result<DownloadedFile>)> = JoinSet::new();
        let mut pending = listing.batches.into_iter();

        while let Some(record) = pending.next() {
            if !force_refresh && record.downloaded && self.blob_present(&record).await {
                debug!(batch_id = %record.batch_id, "Already downloaded, skipping");
                report.skipped_files += 1;
                report.downloaded_files += 1;
                continue;
            }

            let permit = if deadline.is_some_and(|(at, _)| tokio::time::Instant::now() >= at) {
                None
            } else {
                within(deadline, "sync_org_batches", async {
                    workers
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| BatchError::transient("sync_org_batches", e.to_string()))
                })
                .await
                .ok()
            };
            let Some(permit) = permit else {
                let after = deadline.map_or(Duration::ZERO, |(_, after)| after);
                warn!(org_code, after_secs = after.as_secs(), "Sync deadline reached, not starting remaining files");
                report.deadline_reached = true;
                for unstarted in std::iter::once(record).chain(pending.by_ref()) {
                    if !force_refresh && unstarted.downloaded {
                        report.skipped_files += 1;
                        report.downloaded_files += 1;
                    } else {
                        report.failed_files += 1;
                        report.failures.push(SyncFailure {
                            batch_id: unstarted.batch_id,
                            error: BatchError::Timeout {
                                operation: "download_batch".to_string(),
                                after,
                            },
                        });
                    }
                }
                break;
            };

            let this = self.clone();
            let org = org_code.to_string();
            tasks.spawn(async move {
                let _permit = permit;
                let download = this.download_batch_with(&record.batch_id, &org, force_refresh);
                let result = within(deadline, "download_batch", download).await;
                (record.batch_id, result)
            });

            // Fold in whatever has finished so failures are logged as they happen
            while let Some(joined) = tasks.try_join_next() {
                report.absorb(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            report.absorb(joined);
        }
        if report
            .failures
            .iter()
            .any(|f| matches!(f.error, BatchError::Timeout { .. }))
        {
            report.deadline_reached = true;
        }

        report.duration = start.elapsed();
        crate::metrics::record_sync_files("downloaded", report.downloaded_files - report.skipped_files);
        crate::metrics::record_sync_files("skipped", report.skipped_files);
        crate::metrics::record_sync_files("failed", report.failed_files);
        info!(
            org_code,
            total = report.total_files,
            downloaded = report.downloaded_files,
            failed = report.failed_files,
            skipped = report.skipped_files,
            bytes = report.total_bytes,
            deadline_reached = report.deadline_reached,
            duration_ms = report.duration.as_millis() as u64,
            "Org sync finished"
        );
        Ok(report)
    }

    async fn blob_present(&self, record: &BatchRecord) -> bool {
        let handle = BlobHandle::for_key(&BatchRecord::blob_key(&record.batch_id));
        match self.store.exists(&handle).await {
            Ok(present) => present,
            Err(e) => {
                warn!(batch_id = %record.batch_id, error = %e, "Blob presence check failed");
                false
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INFO / STORAGE / DELETE
    // ═══════════════════════════════════════════════════════════════════════

    /// The stored record for `batch_id`, from any org.
    pub async fn get_batch_info(&self, batch_id: &str) -> Result<BatchRecord> {
        validate_batch_id(batch_id)?;
        self.load_record(batch_id)
            .await?
            .ok_or_else(|| BatchError::batch_not_found(batch_id, None))
    }

    /// A batch's bytes from cache or the persistent store. Never calls the remote.
    pub async fn get_batch_file_from_storage(&self, batch_id: &str) -> Result<Option<Vec<u8>>> {
        validate_batch_id(batch_id)?;
        let Some(record) = self.load_record(batch_id).await? else {
            return Ok(None);
        };
        Ok(self.read_local(&record).await?.map(|file| file.bytes))
    }

    /// Remove every blob, record and cache entry for `org_code`.
    ///
    /// Returns how many batch records were removed.
    #[tracing::instrument(skip(self))]
    pub async fn delete_org_batches(&self, org_code: &str) -> Result<usize> {
        validate_org_code(org_code)?;

        let mut batch_ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.value().org_code == org_code)
            .map(|r| r.key().clone())
            .collect();

        let stored = self
            .store
            .list_prefix("record/")
            .await
            .map_err(|e| BatchError::storage("delete_org_batches", e))?;
        for handle in stored {
            let Some(batch_id) = handle.as_str().strip_prefix("record/") else {
                continue;
            };
            if batch_ids.iter().any(|id| id == batch_id) {
                continue;
            }
            if let Some(record) = self.load_record(batch_id).await? {
                if record.org_code == org_code {
                    batch_ids.push(record.batch_id);
                }
            }
        }

        for batch_id in &batch_ids {
            let lock = self.record_lock(batch_id);
            let _guard = lock.lock().await;

            self.store
                .delete_blob(&BlobHandle::for_key(&BatchRecord::blob_key(batch_id)))
                .await
                .map_err(|e| BatchError::storage("delete_org_batches", e))?;
            self.cache.invalidate(&CacheKey::file(batch_id)).await?;
            self.store
                .delete_blob(&BlobHandle::for_key(&BatchRecord::record_key(batch_id)))
                .await
                .map_err(|e| BatchError::storage("delete_org_batches", e))?;
            self.records.remove(batch_id);
        }
        self.cache.invalidate(&CacheKey::listing(org_code)).await?;

        info!(org_code, deleted = batch_ids.len(), "Deleted org batches");
        Ok(batch_ids.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECORDS
    // ═══════════════════════════════════════════════════════════════════════

    async fn load_record(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        let indexed = self.records.get(batch_id).map(|r| r.value().clone());
        if indexed.is_some() {
            return Ok(indexed);
        }

        let handle = BlobHandle::for_key(&BatchRecord::record_key(batch_id));
        let Some(bytes) = self
            .store
            .get_blob(&handle)
            .await
            .map_err(|e| BatchError::storage("load_record", e))?
        else {
            return Ok(None);
        };
        let record: BatchRecord =
            serde_json::from_slice(&bytes).map_err(|e| BatchError::storage("decode_record", e))?;
        self.records.insert(batch_id.to_string(), record.clone());
        Ok(Some(record))
    }

    /// Store first, index second.
    async fn persist_record(&self, record: &BatchRecord) -> Result<()> {
        let json = serde_json::to_vec(record).map_err(|e| BatchError::storage("encode_record", e))?;
        self.store
            .put_blob(&BatchRecord::record_key(&record.batch_id), &json)
            .await
            .map_err(|e| BatchError::storage("put_record", e))?;
        self.records.insert(record.batch_id.clone(), record.clone());
        Ok(())
    }

    fn record_lock(&self, batch_id: &str) -> Arc<Mutex<()>> {
        self.record_locks
            .entry(batch_id.to_string())
            .or_default()
            .clone()
    }
}

impl SyncReport {
    fn absorb(&mut self, joined: std::result::Result<(String, Result<DownloadedFile>), tokio::task::JoinError>) {
        match joined {
            Ok((_, Ok(file))) => {
                self.downloaded_files += 1;
                if file.source == FileSource::Remote {
                    self.total_bytes += file.bytes.len() as u64;
                }
            }
            Ok((batch_id, Err(error))) => {
                error!(batch_id = %batch_id, error = %error, "Batch download failed");
                self.failed_files += 1;
                self.failures.push(SyncFailure { batch_id, error });
            }
            Err(join_err) => {
                error!(error = %join_err, "Batch download task aborted");
                self.failed_files += 1;
                self.failures.push(SyncFailure {
                    batch_id: String::new(),
                    error: BatchError::DownloadFailed {
                        target: "sync worker".to_string(),
                        reason: join_err.to_string(),
                        attempts: 0,
                    },
                });
            }
        }
    }
}

/// Run `fut`, failing with `Timeout` once `deadline` passes.
async fn within<T>(
    deadline: Option<(tokio::time::Instant, Duration)>,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some((at, after)) => tokio::time::timeout_at(at, fut).await.unwrap_or_else(|_| {
            Err(BatchError::Timeout {
                operation: operation.to_string(),
                after,
            })
        }),
        None => fut.await,
    }
}

/// `true` when the record carries no hash or the hash matches.
fn verify_hash(record: &BatchRecord, bytes: &[u8]) -> bool {
    let Some(expected) = &record.content_hash else {
        return true;
    };
    let actual = hex::encode(Sha256::digest(bytes));
    if &actual == expected {
        return true;
    }
    warn!(batch_id = %record.batch_id, expected = %expected, actual = %actual, "Content hash mismatch");
    crate::metrics::record_corruption(&record.batch_id);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RemoteBatch;
    use crate::storage::{InMemoryStore, StorageError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedRemote {
        batches: Vec<RemoteBatch>,
        listing_calls: AtomicUsize,
        file_calls: AtomicUsize,
    }

    impl ScriptedRemote {
        fn with_batches(ids: &[&str]) -> Self {
            Self {
                batches: ids.iter().map(|id| RemoteBatch::new(*id)).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RemoteCollector for ScriptedRemote {
        async fn fetch_org_listing(&self, org_code: &str) -> Result<RemoteListing> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            if org_code == "NOPE00" {
                return Err(BatchError::org_not_found(org_code));
            }
            Ok(RemoteListing {
                org_name: None,
                batches: self.batches.clone(),
            })
        }

        async fn fetch_batch_bytes(&self, batch_id: &str) -> Result<RemotePayload> {
            self.file_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RemotePayload {
                bytes: format!("%PDF {batch_id}").into_bytes(),
                content_type: None,
            })
        }
    }

    /// Fails blob writes on demand, delegates everything else.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        fail_blob_writes: AtomicBool,
    }

    #[async_trait]
    impl PersistentStore for FlakyStore {
        async fn put_blob(&self, key: &str, bytes: &[u8]) -> std::result::Result<BlobHandle, StorageError> {
            if key.starts_with("blob/") && self.fail_blob_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("volume full".into()));
            }
            self.inner.put_blob(key, bytes).await
        }
        async fn get_blob(&self, h: &BlobHandle) -> std::result::Result<Option<Vec<u8>>, StorageError> {
            self.inner.get_blob(h).await
        }
        async fn exists(&self, h: &BlobHandle) -> std::result::Result<bool, StorageError> {
            self.inner.exists(h).await
        }
        async fn delete_blob(&self, h: &BlobHandle) -> std::result::Result<(), StorageError> {
            self.inner.delete_blob(h).await
        }
        async fn list_prefix(&self, p: &str) -> std::result::Result<Vec<BlobHandle>, StorageError> {
            self.inner.list_prefix(p).await
        }
    }

    fn service(remote: Arc<ScriptedRemote>, store: Arc<dyn PersistentStore>) -> BatchService {
        let config = BatchEngineConfig {
            requests_per_period: 1000,
            ..Default::default()
        };
        BatchService::new(config, remote, store)
            .unwrap()
            .with_retry_policy(RetryPolicy::test())
    }

    #[tokio::test]
    async fn test_listing_is_cached_after_first_fetch() {
        let remote = Arc::new(ScriptedRemote::with_batches(&["b1", "b2"]));
        let svc = service(remote.clone(), Arc::new(InMemoryStore::new()));

        let first = svc.list_batches("ABC123", false).await.unwrap();
        assert_eq!(first.set.org_name, "ABC123");
        assert_eq!(first.set.batch_ids, vec!["b1", "b2"]);
        assert_eq!(first.served_from, None);

        let second = svc.list_batches("ABC123", false).await.unwrap();
        assert_eq!(second.served_from, Some(crate::cache::Tier::Memory));
        assert_eq!(remote.listing_calls.load(Ordering::SeqCst), 1);

        svc.list_batches("ABC123", true).await.unwrap();
        assert_eq!(remote.listing_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_org_is_not_served_stale() {
        let remote = Arc::new(ScriptedRemote::default());
        let svc = service(remote.clone(), Arc::new(InMemoryStore::new()));

        let err = svc.list_batches("NOPE00", false).await.unwrap_err();
        assert!(matches!(err, BatchError::OrgCodeNotFound { .. }));
        // Not retryable, one call only
        assert_eq!(remote.listing_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_download_remote_then_cache() {
        let remote = Arc::new(ScriptedRemote::with_batches(&["b1"]));
        let svc = service(remote.clone(), Arc::new(InMemoryStore::new()));

        let first = svc.download_batch("b1", "ABC123").await.unwrap();
        assert_eq!(first.source, FileSource::Remote);
        assert_eq!(first.bytes, b"%PDF b1");
        assert!(first.record.downloaded);
        assert_eq!(first.record.size_bytes, 7);

        let second = svc.download_batch("b1", "ABC123").await.unwrap();
        assert_eq!(second.source, FileSource::Cache(crate::cache::Tier::Memory));
        assert_eq!(remote.file_calls.load(Ordering::SeqCst), 1);

        let forced = svc.download_batch_with("b1", "ABC123", true).await.unwrap();
        assert_eq!(forced.source, FileSource::Remote);
        assert_eq!(remote.file_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_batch_is_not_found() {
        let remote = Arc::new(ScriptedRemote::with_batches(&["b1"]));
        let svc = service(remote.clone(), Arc::new(InMemoryStore::new()));

        let err = svc.download_batch("b9", "ABC123").await.unwrap_err();
        assert_eq!(err.type_tag(), "BatchFileNotFoundError");
        assert_eq!(remote.file_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_fetched_again() {
        let remote = Arc::new(ScriptedRemote::with_batches(&["b1"]));
        let store = Arc::new(InMemoryStore::new());
        let svc = service(remote.clone(), store.clone());

        svc.download_batch("b1", "ABC123").await.unwrap();
        store.put_blob(&BatchRecord::blob_key("b1"), b"garbage").await.unwrap();
        svc.cache().invalidate(&CacheKey::file("b1")).await.unwrap();

        assert_eq!(svc.get_batch_file_from_storage("b1").await.unwrap(), None);

        let again = svc.download_batch("b1", "ABC123").await.unwrap();
        assert_eq!(again.source, FileSource::Remote);
        assert_eq!(again.bytes, b"%PDF b1");
        assert_eq!(remote.file_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_blob_write_leaves_record_undownloaded() {
        let remote = Arc::new(ScriptedRemote::with_batches(&["b1"]));
        let store = Arc::new(FlakyStore::default());
        let svc = service(remote, store.clone());

        svc.list_batches("ABC123", false).await.unwrap();
        store.fail_blob_writes.store(true, Ordering::SeqCst);

        let err = svc.download_batch("b1", "ABC123").await.unwrap_err();
        assert!(matches!(err, BatchError::Storage { .. }));

        let info = svc.get_batch_info("b1").await.unwrap();
        assert!(!info.downloaded);
        assert!(!svc.cache().memory().contains(&CacheKey::file("b1")));
    }

    #[tokio::test]
    async fn test_records_survive_a_restart() {
        let remote = Arc::new(ScriptedRemote::with_batches(&["b1"]));
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());

        let svc = service(remote.clone(), store.clone());
        svc.download_batch("b1", "ABC123").await.unwrap();
        svc.cache().flush().await;

        let restarted = service(remote.clone(), store);
        let info = restarted.get_batch_info("b1").await.unwrap();
        assert!(info.downloaded);

        let file = restarted.download_batch("b1", "ABC123").await.unwrap();
        assert_eq!(file.source, FileSource::Storage);
        assert_eq!(remote.file_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verify_hash() {
        let mut record = BatchRecord::from_remote("ABC123", RemoteBatch::new("b1"), Utc::now());
        assert!(verify_hash(&record, b"anything"));

        record.content_hash = Some(hex::encode(Sha256::digest(b"abc")));
        assert!(verify_hash(&record, b"abc"));
        assert!(!verify_hash(&record, b"abd"));
    }
}
