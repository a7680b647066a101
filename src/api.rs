// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing boundary.
//!
//! Every operation returns an [`ApiResponse`]; errors never cross this layer
//! as `Err`. A failed call has `success = false`, a message and one
//! `{type, message}` descriptor per error.
//!
//! ```
//! use batch_engine::api::ApiResponse;
//! use batch_engine::BatchError;
//!
//! let resp: ApiResponse<()> = ApiResponse::failure(&BatchError::org_not_found("ZZZ999"));
//! let json = serde_json::to_value(&resp).unwrap();
//! assert_eq!(json["success"], false);
//! assert_eq!(json["errors"][0]["type"], "OrgCodeNotFoundError");
//! ```

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{BatchError, Result};
use crate::model::BatchRecord;
use crate::service::BatchService;
use crate::validate::format_file_size;

/// `{type, message}` pair describing one failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDescriptor {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl From<&BatchError> for ErrorDescriptor {
    fn from(err: &BatchError) -> Self {
        let message = match err {
            BatchError::OrgCodeNotFound { org_code } => {
                format!("Organization code '{org_code}' was not found")
            }
            BatchError::BatchFileNotFound { batch_id, .. } => {
                format!("Batch '{batch_id}' does not exist")
            }
            BatchError::DownloadFailed { target, reason, .. } => {
                format!("Could not download '{target}': {reason}")
            }
            BatchError::Validation { field, reason, .. } => format!("Invalid {field}: {reason}"),
            BatchError::Storage { operation, .. } => {
                format!("Storage is unavailable ({operation}), please try again later")
            }
            BatchError::RateLimitExceeded { retry_after } => match retry_after {
                Some(after) => format!("Too many requests, retry in {:.1}s", after.as_secs_f64()),
                None => "Too many requests, please slow down".to_string(),
            },
            BatchError::Transient { operation, reason } => {
                format!("Upstream hiccup during {operation}: {reason}")
            }
            BatchError::Timeout { operation, after } => {
                format!("{operation} did not finish within {}s", after.as_secs())
            }
        };
        Self {
            error_type: err.type_tag().to_string(),
            message,
        }
    }
}

/// Envelope for every operation's result.
///
/// `data` is flattened, so its fields sit beside `success` and `message`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDescriptor>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn failure(err: &BatchError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
            errors: vec![ErrorDescriptor::from(err)],
        }
    }
}

/// One batch in a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub batch_name: String,
    pub filename: String,
    pub file_size: u64,
    pub file_size_formatted: String,
    pub content_type: String,
    pub created_at: String,
    pub downloaded: bool,
    pub downloaded_at: Option<String>,
}

impl From<&BatchRecord> for BatchSummary {
    fn from(record: &BatchRecord) -> Self {
        Self {
            batch_id: record.batch_id.clone(),
            batch_name: record.batch_name.clone(),
            filename: record.filename.clone(),
            file_size: record.size_bytes,
            file_size_formatted: format_file_size(record.size_bytes),
            content_type: record.content_type.clone(),
            created_at: iso8601(record.created_at),
            downloaded: record.downloaded,
            downloaded_at: record.downloaded_at.map(iso8601),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListBatchesData {
    pub org_code: String,
    pub org_name: String,
    pub batch_count: usize,
    pub batches: Vec<BatchSummary>,
    /// The upstream refresh failed and this is the last-known listing
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadData {
    pub batch_id: String,
    pub filename: String,
    pub file_size: u64,
    pub file_size_formatted: String,
    pub content_type: String,
    pub file_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailureData {
    pub batch_id: String,
    pub error: ErrorDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncData {
    pub org_code: String,
    pub total_files: usize,
    pub downloaded_files: usize,
    pub failed_files: usize,
    pub total_bytes: u64,
    pub total_bytes_formatted: String,
    pub progress_percentage: f64,
    pub duration_seconds: f64,
    pub deadline_reached: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SyncFailureData>,
}

/// Every stored field of a batch, including upstream metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchDetail {
    #[serde(flatten)]
    pub summary: BatchSummary,
    pub org_code: String,
    pub content_hash: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchInfoData {
    pub batch: BatchDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteData {
    pub org_code: String,
    pub deleted_batches: usize,
}

/// Structured front door over [`BatchService`].
#[derive(Clone)]
pub struct BatchApi {
    service: Arc<BatchService>,
}

impl BatchApi {
    pub fn new(service: BatchService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    #[must_use]
    pub fn service(&self) -> &BatchService {
        &self.service
    }

    pub async fn get_batches_by_org_code(&self, org_code: &str, force_refresh: bool) -> ApiResponse<ListBatchesData> {
        let result = self
            .bounded("get_batches_by_org_code", self.service.list_batches(org_code, force_refresh))
            .await;
        respond("get_batches_by_org_code", result, |listing| {
            let count = listing.batches.len();
            let message = if listing.stale {
                format!("Found {count} batches for {} (cached, upstream refresh failed)", listing.set.org_name)
            } else {
                format!("Found {count} batches for {}", listing.set.org_name)
            };
            let data = ListBatchesData {
                org_code: listing.set.org_code,
                org_name: listing.set.org_name,
                batch_count: count,
                batches: listing.batches.iter().map(BatchSummary::from).collect(),
                stale: listing.stale,
            };
            (message, data)
        })
    }

    pub async fn download_batch(&self, batch_id: &str, org_code: &str) -> ApiResponse<DownloadData> {
        let result = self
            .bounded("download_batch", self.service.download_batch(batch_id, org_code))
            .await;
        respond("download_batch", result, |file| {
            let message = format!("Downloaded {}", file.record.filename);
            let data = DownloadData {
                file_size: file.bytes.len() as u64,
                file_size_formatted: format_file_size(file.bytes.len() as u64),
                batch_id: file.record.batch_id,
                filename: file.record.filename,
                content_type: file.record.content_type,
                file_data: file.bytes,
            };
            (message, data)
        })
    }

    /// A sync that ran to the end is a success even when some files failed;
    /// those are listed under `failures`.
    pub async fn sync_org_batches(&self, org_code: &str, force_refresh: bool) -> ApiResponse<SyncData> {
        // Deadline is applied per file inside the service
        let result = self.service.sync_org_batches(org_code, force_refresh).await;
        respond("sync_org_batches", result, |report| {
            let mut message = format!(
                "Synchronized {}/{} files for {}",
                report.downloaded_files, report.total_files, report.org_code
            );
            if report.deadline_reached {
                message.push_str(" (deadline reached)");
            }
            let data = SyncData {
                total_files: report.total_files,
                downloaded_files: report.downloaded_files,
                failed_files: report.failed_files,
                total_bytes: report.total_bytes,
                total_bytes_formatted: format_file_size(report.total_bytes),
                progress_percentage: report.progress_percentage(),
                duration_seconds: report.duration.as_secs_f64(),
                deadline_reached: report.deadline_reached,
                failures: report
                    .failures
                    .iter()
                    .map(|f| SyncFailureData {
                        batch_id: f.batch_id.clone(),
                        error: ErrorDescriptor::from(&f.error),
                    })
                    .collect(),
                org_code: report.org_code,
            };
            (message, data)
        })
    }

    pub async fn get_batch_info(&self, batch_id: &str) -> ApiResponse<BatchInfoData> {
        let result = self
            .bounded("get_batch_info", self.service.get_batch_info(batch_id))
            .await;
        respond("get_batch_info", result, |record| {
            let batch = BatchDetail {
                summary: BatchSummary::from(&record),
                org_code: record.org_code,
                content_hash: record.content_hash,
                metadata: record.metadata,
            };
            ("Batch information retrieved".to_string(), BatchInfoData { batch })
        })
    }

    pub async fn delete_org_batches(&self, org_code: &str) -> ApiResponse<DeleteData> {
        let result = self
            .bounded("delete_org_batches", self.service.delete_org_batches(org_code))
            .await;
        respond("delete_org_batches", result, |deleted| {
            let message = format!("Deleted {deleted} batches for {org_code}");
            let data = DeleteData {
                org_code: org_code.to_string(),
                deleted_batches: deleted,
            };
            (message, data)
        })
    }

    /// Apply the configured operation deadline. Dropping the inner future
    /// detaches it from any shared fetch without cancelling that fetch.
    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.service.config().operation_timeout() {
            Some(after) => tokio::time::timeout(after, fut).await.map_err(|_| BatchError::Timeout {
                operation: operation.to_string(),
                after,
            })?,
            None => fut.await,
        }
    }
}

fn respond<T, D>(operation: &str, result: Result<T>, build: impl FnOnce(T) -> (String, D)) -> ApiResponse<D> {
    match result {
        Ok(value) => {
            let (message, data) = build(value);
            ApiResponse::ok(message, data)
        }
        Err(err) => {
            warn!(operation, error = %err, "Operation failed");
            crate::metrics::record_error(operation, err.type_tag());
            ApiResponse::failure(&err)
        }
    }
}

fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_every_variant_has_a_descriptor() {
        let errors = [
            BatchError::org_not_found("ZZZ999"),
            BatchError::batch_not_found("b1", Some("ABC123")),
            BatchError::DownloadFailed { target: "b1".into(), reason: "boom".into(), attempts: 3 },
            BatchError::validation("org_code", "", "Organization code cannot be empty"),
            BatchError::storage("put_blob", "disk full"),
            BatchError::RateLimitExceeded { retry_after: Some(Duration::from_millis(1500)) },
            BatchError::transient("fetch", "reset"),
            BatchError::Timeout { operation: "sync".into(), after: Duration::from_secs(5) },
        ];
        for err in &errors {
            let d = ErrorDescriptor::from(err);
            assert_eq!(d.error_type, err.type_tag());
            assert!(!d.message.is_empty());
        }
        assert_eq!(
            ErrorDescriptor::from(&errors[5]).message,
            "Too many requests, retry in 1.5s"
        );
    }

    #[test]
    fn test_success_envelope_flattens_data() {
        let resp = ApiResponse::ok("Deleted 2 batches for ABC123", DeleteData {
            org_code: "ABC123".into(),
            deleted_batches: 2,
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["deleted_batches"], 2);
        assert!(json.get("errors").is_none());
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_summary_formats_dates_and_sizes() {
        let now = DateTime::parse_from_rfc3339("2025-03-01T09:30:00Z").unwrap().with_timezone(&Utc);
        let mut record = BatchRecord::from_remote("ABC123", crate::model::RemoteBatch::new("b1"), now);
        record.size_bytes = 2048;

        let summary = BatchSummary::from(&record);
        assert_eq!(summary.created_at, "2025-03-01T09:30:00Z");
        assert_eq!(summary.file_size_formatted, "2.00 KB");
        assert_eq!(summary.downloaded_at, None);

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json["downloaded_at"].is_null());
    }
}
