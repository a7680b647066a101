// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for batch retrieval.
//!
//! Every failure the engine can produce is one variant of [`BatchError`].
//! The API boundary matches these exhaustively to build `{type, message}`
//! descriptors, so adding a variant is a compile error until it is mapped.
//!
//! # Retry classification
//!
//! ```
//! use batch_engine::BatchError;
//!
//! let transient = BatchError::transient("fetch_batch_bytes", "connection reset");
//! assert!(transient.is_retryable());
//!
//! let fatal = BatchError::validation("org_code", "!!", "must be alphanumeric");
//! assert!(!fatal.is_retryable());
//! assert_eq!(fatal.type_tag(), "ValidationError");
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::storage::traits::StorageError;

/// Closed set of failures surfaced by the engine.
///
/// `Clone` so a single in-flight result can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    /// Upstream has no such organization.
    #[error("Organization code '{org_code}' not found or is invalid")]
    OrgCodeNotFound { org_code: String },

    /// The batch id is unknown (for the given org, when one is known).
    #[error("Batch file '{batch_id}' not found{}", .org_code.as_ref().map(|o| format!(" for organization '{o}'")).unwrap_or_default())]
    BatchFileNotFound {
        batch_id: String,
        org_code: Option<String>,
    },

    /// A remote fetch gave up, either on exhausted retries or a bad payload.
    #[error("Failed to download '{target}' after {attempts} attempt(s): {reason}")]
    DownloadFailed {
        target: String,
        reason: String,
        attempts: u32,
    },

    /// Malformed input, rejected before any I/O.
    #[error("Validation failed for field '{field}' with value '{value}': {reason}")]
    Validation {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// Persistent store or filesystem failure.
    #[error("Storage operation '{operation}' failed: {reason}")]
    Storage { operation: String, reason: String },

    /// A non-blocking acquisition found the rate window full.
    #[error("API rate limit exceeded{}", .retry_after.map(|d| format!(". Retry after {:.1} seconds", d.as_secs_f64())).unwrap_or_default())]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Network-level hiccup reported by the remote collector.
    #[error("Transient failure during '{operation}': {reason}")]
    Transient { operation: String, reason: String },

    /// The caller's deadline elapsed while the operation was suspended.
    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl BatchError {
    pub fn org_not_found(org_code: impl Into<String>) -> Self {
        Self::OrgCodeNotFound { org_code: org_code.into() }
    }

    pub fn batch_not_found(batch_id: impl Into<String>, org_code: Option<&str>) -> Self {
        Self::BatchFileNotFound {
            batch_id: batch_id.into(),
            org_code: org_code.map(str::to_string),
        }
    }

    pub fn validation(field: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transient(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Default retry predicate.
    ///
    /// Network hiccups, storage I/O and rate-window rejections are worth another
    /// attempt; validation, not-found and exhausted downloads are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Storage { .. } | Self::RateLimitExceeded { .. }
        )
    }

    /// Wire-level type tag used in `{type, message}` error descriptors.
    #[must_use]
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::OrgCodeNotFound { .. } => "OrgCodeNotFoundError",
            Self::BatchFileNotFound { .. } => "BatchFileNotFoundError",
            Self::DownloadFailed { .. } => "DownloadFailedError",
            Self::Validation { .. } => "ValidationError",
            Self::Storage { .. } => "StorageError",
            Self::RateLimitExceeded { .. } => "RateLimitExceededError",
            Self::Transient { .. } => "TransientError",
            Self::Timeout { .. } => "TimeoutError",
        }
    }
}

impl From<StorageError> for BatchError {
    fn from(err: StorageError) -> Self {
        let operation = match &err {
            StorageError::NotFound => "read",
            StorageError::Backend(_) => "backend",
            StorageError::Corruption { .. } => "verify",
        };
        Self::storage(operation, err)
    }
}

impl From<std::io::Error> for BatchError {
    fn from(err: std::io::Error) -> Self {
        Self::storage("filesystem", err)
    }
}

pub type Result<T, E = BatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_match_wire_format() {
        let err = BatchError::org_not_found("KALYAN");
        assert_eq!(err.to_string(), "Organization code 'KALYAN' not found or is invalid");

        let err = BatchError::batch_not_found("b1", Some("ABC123"));
        assert_eq!(err.to_string(), "Batch file 'b1' not found for organization 'ABC123'");

        let err = BatchError::batch_not_found("b1", None);
        assert_eq!(err.to_string(), "Batch file 'b1' not found");
    }

    #[test]
    fn test_rate_limit_message_with_retry_after() {
        let err = BatchError::RateLimitExceeded { retry_after: Some(Duration::from_secs(3)) };
        assert_eq!(err.to_string(), "API rate limit exceeded. Retry after 3.0 seconds");

        let err = BatchError::RateLimitExceeded { retry_after: None };
        assert_eq!(err.to_string(), "API rate limit exceeded");
    }

    #[test]
    fn test_retry_classification() {
        assert!(BatchError::transient("op", "reset").is_retryable());
        assert!(BatchError::storage("put_blob", "disk full").is_retryable());
        assert!(BatchError::RateLimitExceeded { retry_after: None }.is_retryable());

        assert!(!BatchError::org_not_found("ABC").is_retryable());
        assert!(!BatchError::batch_not_found("b", None).is_retryable());
        assert!(!BatchError::validation("org_code", "", "empty").is_retryable());
        assert!(!BatchError::DownloadFailed {
            target: "b".into(),
            reason: "x".into(),
            attempts: 3
        }
        .is_retryable());
        assert!(!BatchError::Timeout { operation: "op".into(), after: Duration::from_secs(1) }.is_retryable());
    }

    #[test]
    fn test_type_tags_are_distinct() {
        let errors = [
            BatchError::org_not_found("a"),
            BatchError::batch_not_found("b", None),
            BatchError::DownloadFailed { target: "t".into(), reason: "r".into(), attempts: 1 },
            BatchError::validation("f", "v", "r"),
            BatchError::storage("o", "r"),
            BatchError::RateLimitExceeded { retry_after: None },
            BatchError::transient("o", "r"),
            BatchError::Timeout { operation: "o".into(), after: Duration::ZERO },
        ];
        let mut tags: Vec<_> = errors.iter().map(BatchError::type_tag).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), errors.len());
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: BatchError = StorageError::Backend("connection refused".into()).into();
        assert_eq!(err.type_tag(), "StorageError");
        assert!(err.to_string().contains("connection refused"));
    }
}
