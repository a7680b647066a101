// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Two entry points:
//! - [`retry`] retries every error, for backends where any failure is worth
//!   another go (the SQL blob store's connection hiccups).
//! - [`execute`] classifies each failure with the policy's predicate; fatal
//!   errors abort at once, and exhausted retries surface as
//!   [`BatchError::DownloadFailed`].
//!
//! # Example
//!
//! ```
//! use batch_engine::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::remote();
//! assert_eq!(policy.max_attempts, 3);
//!
//! // First retry waits base_delay, then doubles up to max_delay
//! assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
//! assert_eq!(policy.backoff_for(2), Duration::from_secs(1));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::BatchError;

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryPolicy::startup()`] - Fast-fail for initial connections
/// - [`RetryPolicy::query()`] - Quick retry for individual storage queries
/// - [`RetryPolicy::remote()`] - Upstream fetches, with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Add uniform jitter in `[0, delay]` to every backoff
    pub jitter: bool,
    /// Decides whether a failure is worth another attempt
    pub retryable: fn(&BatchError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::remote()
    }
}

impl RetryPolicy {
    /// Fast-fail retry for initial startup connection.
    /// 5 attempts with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(2),
            jitter: false,
            retryable: BatchError::is_retryable,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(2),
            jitter: false,
            retryable: BatchError::is_retryable,
        }
    }

    /// Upstream fetches: a few attempts, jittered so concurrent callers
    /// don't retry in lockstep.
    #[must_use]
    pub fn remote() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            retryable: BatchError::is_retryable,
        }
    }

    /// Fast retry for tests (minimal delays, deterministic)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(10),
            jitter: false,
            retryable: BatchError::is_retryable,
        }
    }

    /// Backoff before the `retry`-th retry (1-based), before jitter:
    /// `min(base_delay * factor^(retry-1), max_delay)`.
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(scaled.max(0.0).round() as u64)
        }
    }

    /// Backoff with jitter applied (if enabled).
    fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff_for(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=delay.as_nanos() as u64);
        delay + Duration::from_nanos(extra)
    }
}

/// Retry `operation` on every error until `max_attempts` is reached.
/// The last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if attempts >= max {
                    return Err(err);
                }

                let delay = policy.delay_for(attempts);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, max, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}

/// Run `operation` under `policy`, classifying failures with `policy.retryable`.
///
/// - success → `Ok`
/// - fatal error → returned as-is after a single attempt
/// - retryable error on the last attempt → [`BatchError::DownloadFailed`]
///   carrying the last error's message and the attempt count
///
/// Each attempt is a fresh call to `operation`, so anything it gates on (a
/// rate limiter token, say) is consumed per attempt.
pub async fn execute<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, BatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BatchError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !(policy.retryable)(&err) {
                    return Err(err);
                }

                if attempts >= max {
                    warn!(operation = operation_name, attempts, error = %err, "Retries exhausted");
                    crate::metrics::record_retry_exhausted(operation_name);
                    return Err(BatchError::DownloadFailed {
                        target: operation_name.to_string(),
                        reason: err.to_string(),
                        attempts,
                    });
                }

                let delay = policy.delay_for(attempts);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max_attempts = max,
                    error = %err,
                    ?delay,
                    "Attempt failed, retrying"
                );
                crate::metrics::record_retry(operation_name);
                sleep(delay).await;
            }
        }
    }
}
