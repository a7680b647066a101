// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound request rate limiting.
//!
//! A sliding-window log: the limiter remembers when each of the last `limit`
//! grants happened and admits a new one only once the oldest has aged out of
//! `period`. Unlike a fixed window, no rolling period can ever see more than
//! `limit` grants, even across a window boundary.
//!
//! ```text
//!   limit = 3, period = 1s
//!
//!   t=0.0  grant ─┐
//!   t=0.0  grant  │ window full
//!   t=0.0  grant ─┘
//!   t=0.2  acquire ──── suspended until t=1.0 (oldest grant + period)
//! ```
//!
//! # Example
//!
//! ```
//! use batch_engine::RateLimiter;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(2, Duration::from_secs(60));
//! assert!(limiter.try_acquire().is_ok());
//! assert!(limiter.try_acquire().is_ok());
//! assert!(limiter.try_acquire().is_err()); // window is full
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;

use crate::error::BatchError;

/// Snapshot of the limiter's current window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindow {
    /// Oldest grant still inside the window, if any
    pub window_start: Option<Instant>,
    /// Grants inside the window
    pub count: u32,
    pub limit: u32,
    pub period: Duration,
}

/// Process-wide limiter shared by every remote fetch path.
pub struct RateLimiter {
    limit: u32,
    period: Duration,
    /// Grant instants, oldest first. Never longer than `limit`.
    grants: Mutex<VecDeque<Instant>>,
    granted_total: AtomicU64,
    delayed_total: AtomicU64,
}

impl RateLimiter {
    /// A `limit` of zero is treated as one.
    #[must_use]
    pub fn new(limit: u32, period: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            period,
            grants: Mutex::new(VecDeque::with_capacity(limit as usize)),
            granted_total: AtomicU64::new(0),
            delayed_total: AtomicU64::new(0),
        }
    }

    /// Grant a token now, or report when the next one frees up.
    ///
    /// Pruning and counting happen under one lock so concurrent callers
    /// can never both take the last slot.
    fn poll_grant(&self, now: Instant) -> Result<(), Instant> {
        let mut grants = self.grants.lock();
        while let Some(&oldest) = grants.front() {
            if oldest + self.period <= now {
                grants.pop_front();
            } else {
                break;
            }
        }

        if (grants.len() as u32) < self.limit {
            grants.push_back(now);
            self.granted_total.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            // Full window implies a front element
            Err(grants.front().map_or(now, |&oldest| oldest + self.period))
        }
    }

    /// Non-blocking acquisition for callers that would rather fail than wait.
    ///
    /// The service's own fetch paths always wait; this is for embedders that
    /// share the limiter (via `BatchService::rate_limiter`) and want to shed
    /// load instead, e.g. an interactive request that should fail fast.
    pub fn try_acquire(&self) -> Result<(), BatchError> {
        let now = Instant::now();
        self.poll_grant(now).map_err(|next| {
            crate::metrics::record_rate_limit_rejected();
            BatchError::RateLimitExceeded {
                retry_after: Some(next.saturating_duration_since(now)),
            }
        })
    }

    /// Wait until a token is available.
    ///
    /// Cancel-safe: dropping the future while it sleeps leaves the window untouched.
    pub async fn acquire(&self) {
        let started = Instant::now();
        let mut delayed = false;

        loop {
            match self.poll_grant(Instant::now()) {
                Ok(()) => break,
                Err(next) => {
                    if !delayed {
                        delayed = true;
                        self.delayed_total.fetch_add(1, Ordering::Relaxed);
                        debug!(wait = ?next.saturating_duration_since(Instant::now()), "Rate window full, waiting");
                    }
                    sleep_until(next).await;
                }
            }
        }

        if delayed {
            crate::metrics::record_rate_limit_wait(started.elapsed());
        }
    }

    /// Wait for a token, giving up at `deadline`.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<(), BatchError> {
        let started = Instant::now();
        timeout_at(deadline, self.acquire())
            .await
            .map_err(|_| BatchError::Timeout {
                operation: "rate_limit_acquire".to_string(),
                after: deadline.saturating_duration_since(started),
            })
    }

    /// Wait for a token for at most `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<(), BatchError> {
        self.acquire_until(Instant::now() + timeout).await
    }

    #[must_use]
    pub fn window(&self) -> RateLimitWindow {
        let now = Instant::now();
        let grants = self.grants.lock();
        let live: Vec<Instant> = grants
            .iter()
            .copied()
            .filter(|&t| t + self.period > now)
            .collect();
        RateLimitWindow {
            window_start: live.first().copied(),
            count: live.len() as u32,
            limit: self.limit,
            period: self.period,
        }
    }

    /// Total tokens granted since construction
    #[must_use]
    pub fn granted_total(&self) -> u64 {
        self.granted_total.load(Ordering::Relaxed)
    }

    /// Acquisitions that had to wait at least once
    #[must_use]
    pub fn delayed_total(&self) -> u64 {
        self.delayed_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_n_are_immediate_rest_wait_for_boundary() {
        let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(1)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut granted_at = Vec::new();
        for handle in handles {
            granted_at.push(handle.await.unwrap().duration_since(start));
        }
        granted_at.sort();

        let immediate = granted_at.iter().filter(|d| d.is_zero()).count();
        assert_eq!(immediate, 3);
        for late in &granted_at[3..] {
            assert!(*late >= Duration::from_secs(1), "granted too early: {late:?}");
        }
        assert_eq!(limiter.granted_total(), 5);
        assert_eq!(limiter.delayed_total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rolling_period_exceeds_limit() {
        let limit = 4;
        let period = Duration::from_millis(500);
        let limiter = Arc::new(RateLimiter::new(limit, period));
        let start = Instant::now();

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 37)).await;
                limiter.acquire().await;
                Instant::now().duration_since(start)
            }));
        }

        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }
        grants.sort();

        for (i, &t) in grants.iter().enumerate() {
            let in_window = grants[i..].iter().take_while(|&&u| u < t + period).count();
            assert!(in_window <= limit as usize, "{in_window} grants within {period:?} of {t:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_reports_retry_after() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.try_acquire().unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        match limiter.try_acquire() {
            Err(BatchError::RateLimitExceeded { retry_after: Some(after) }) => {
                assert_eq!(after, Duration::from_secs(6));
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_gives_up_without_consuming() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.acquire().await;

        let result = limiter.acquire_timeout(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BatchError::Timeout { .. })));
        assert_eq!(limiter.window().count, 1);
        assert_eq!(limiter.granted_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_snapshot_ages_out() {
        let limiter = RateLimiter::new(5, Duration::from_secs(2));
        limiter.acquire().await;
        limiter.acquire().await;

        let window = limiter.window();
        assert_eq!(window.count, 2);
        assert_eq!(window.limit, 5);
        assert!(window.window_start.is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        let window = limiter.window();
        assert_eq!(window.count, 0);
        assert!(window.window_start.is_none());
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.limit(), 1);
    }
}
