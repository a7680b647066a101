// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the batch engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `batch_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: memory, filesystem, persistent
//! - `operation`: get, put, invalidate, list, download, sync
//! - `status`: hit, miss, success, error

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::cache::Tier;

/// Record a cache tier operation
pub fn record_cache_operation(tier: Tier, operation: &str, status: &str) {
    counter!(
        "batch_engine_cache_operations_total",
        "tier" => tier.as_str(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "batch_engine_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a call to the remote collector
pub fn record_remote_call(call: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        "batch_engine_remote_calls_total",
        "call" => call.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a retried attempt
pub fn record_retry(operation: &str) {
    counter!(
        "batch_engine_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an operation that ran out of attempts
pub fn record_retry_exhausted(operation: &str) {
    counter!(
        "batch_engine_retries_exhausted_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record time spent suspended on a full rate window
pub fn record_rate_limit_wait(waited: Duration) {
    histogram!("batch_engine_rate_limit_wait_seconds").record(waited.as_secs_f64());
}

/// Record a non-blocking acquisition that was turned away
pub fn record_rate_limit_rejected() {
    counter!("batch_engine_rate_limit_rejected_total").increment(1);
}

/// Record a single-flight outcome (`leader` or `joined`)
pub fn record_singleflight(outcome: &'static str) {
    counter!(
        "batch_engine_singleflight_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record per-file sync results
pub fn record_sync_files(status: &'static str, count: usize) {
    counter!(
        "batch_engine_sync_files_total",
        "status" => status
    )
    .increment(count as u64);
}

/// Record bytes pulled from upstream
pub fn record_bytes_downloaded(bytes: usize) {
    counter!("batch_engine_bytes_downloaded_total").increment(bytes as u64);
}

/// Record a stale listing served in place of a failed refresh
pub fn record_stale_served(org_code: &str) {
    counter!(
        "batch_engine_stale_served_total",
        "org_code" => org_code.to_string()
    )
    .increment(1);
}

/// Record a blob whose stored hash no longer matches its bytes
pub fn record_corruption(id: &str) {
    counter!(
        "batch_engine_corruption_detected_total",
        "id" => id.to_string()
    )
    .increment(1);
}

/// Record an error surfaced at the API boundary
pub fn record_error(operation: &str, error_type: &str) {
    counter!(
        "batch_engine_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record memory-tier eviction
pub fn record_eviction(count: usize, bytes: usize) {
    counter!("batch_engine_evictions_total").increment(count as u64);
    counter!("batch_engine_evicted_bytes_total").increment(bytes as u64);
}

/// Set current memory-tier size in bytes
pub fn set_memory_cache_bytes(bytes: usize) {
    gauge!("batch_engine_memory_cache_bytes").set(bytes as f64);
}

/// Set current memory-tier item count
pub fn set_memory_cache_items(count: usize) {
    gauge!("batch_engine_memory_cache_items").set(count as f64);
}

/// Set number of remote fetches currently in flight
pub fn set_in_flight_fetches(count: usize) {
    gauge!("batch_engine_in_flight_fetches").set(count as f64);
}
