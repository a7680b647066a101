// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the batch engine.
//!
//! # Example
//!
//! ```
//! use batch_engine::BatchEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = BatchEngineConfig::default();
//! assert_eq!(config.requests_per_period, 10);
//! assert_eq!(config.memory_max_bytes, 256 * 1024 * 1024); // 256 MB
//!
//! // From TOML, unspecified fields keep their defaults
//! let config = BatchEngineConfig::from_toml_str(r#"
//!     requests_per_period = 30
//!     cache_dir = "/var/cache/batch-engine"
//!     sync_concurrency = 8
//! "#).unwrap();
//! assert_eq!(config.requests_per_period, 30);
//! assert_eq!(config.max_retries, 3);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BatchError, Result};
use crate::resilience::{RateLimiter, RetryPolicy};

/// Configuration for the batch engine.
///
/// All fields have sensible defaults. Set `cache_dir` to enable the
/// filesystem tier.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchEngineConfig {
    /// Remote calls allowed per `period_secs` (default: 10)
    #[serde(default = "default_requests_per_period")]
    pub requests_per_period: u32,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Retry settings for remote fetches
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: bool,

    /// TTL for cached listings and file bytes (default: 1 hour)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Filesystem tier root. `None` disables the tier.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Memory tier max size in bytes (default: 256 MB)
    #[serde(default = "default_memory_max_bytes")]
    pub memory_max_bytes: usize,

    /// Expired memory entry sweep interval in seconds (0 = disabled)
    #[serde(default)]
    pub sweep_interval_secs: u64,

    /// Remote payloads above this are rejected before persisting (default: 100 MB)
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,

    /// Concurrent downloads during an org sync
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,

    /// Deadline for each API operation in seconds (0 = none)
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Serve the last-known listing, flagged stale, when a refresh fails
    #[serde(default = "default_serve_stale_on_error")]
    pub serve_stale_on_error: bool,
}

fn default_requests_per_period() -> u32 { 10 }
fn default_period_secs() -> u64 { 60 }
fn default_max_retries() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_retry_jitter() -> bool { true }
fn default_cache_ttl_secs() -> u64 { 3600 }
fn default_memory_max_bytes() -> usize { 256 * 1024 * 1024 } // 256 MB
fn default_max_file_size_bytes() -> u64 { 100 * 1024 * 1024 } // 100 MB
fn default_sync_concurrency() -> usize { 5 }
fn default_operation_timeout_secs() -> u64 { 300 }
fn default_serve_stale_on_error() -> bool { true }

impl Default for BatchEngineConfig {
    fn default() -> Self {
        Self {
            requests_per_period: default_requests_per_period(),
            period_secs: default_period_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_dir: None,
            memory_max_bytes: default_memory_max_bytes(),
            sweep_interval_secs: 0,
            max_file_size_bytes: default_max_file_size_bytes(),
            sync_concurrency: default_sync_concurrency(),
            operation_timeout_secs: default_operation_timeout_secs(),
            serve_stale_on_error: default_serve_stale_on_error(),
        }
    }
}

impl BatchEngineConfig {
    /// Parse a TOML document, then validate it.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| BatchError::validation("config", "<toml>", e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.period_secs == 0 {
            return Err(BatchError::validation("period_secs", "0", "must be positive"));
        }
        if self.max_retries == 0 {
            return Err(BatchError::validation("max_retries", "0", "at least one attempt is required"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(BatchError::validation(
                "backoff_factor",
                self.backoff_factor.to_string(),
                "must be a finite number >= 1.0",
            ));
        }
        if self.sync_concurrency == 0 {
            return Err(BatchError::validation("sync_concurrency", "0", "must be positive"));
        }
        Ok(())
    }

    /// Retry policy for remote fetches.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.retry_jitter,
            retryable: BatchError::is_retryable,
        }
    }

    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.requests_per_period, Duration::from_secs(self.period_secs))
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// `None` when operations run without a deadline.
    #[must_use]
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_secs > 0).then(|| Duration::from_secs(self.operation_timeout_secs))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}
