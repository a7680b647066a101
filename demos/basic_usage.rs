// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic batch-engine usage example.
//!
//! Demonstrates:
//! 1. Wiring a `BatchService` over an in-memory SQLite blob store
//! 2. Listing an organization's batches (remote, then cache)
//! 3. Downloading one file through a flaky upstream (retried)
//! 4. Syncing the whole org, then syncing again (no refetch)
//! 5. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=batch_engine=debug cargo run --example basic_usage
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tracing_subscriber::EnvFilter;

use batch_engine::{
    BatchApi, BatchEngineConfig, BatchError, BatchService, RemoteBatch, RemoteCollector, RemoteListing,
    RemotePayload, Result, SqlBlobStore,
};

/// Upstream stand-in: 8 batches for KALYAN, and every third file request
/// drops the connection once.
struct DemoUpstream {
    file_requests: AtomicUsize,
}

#[async_trait]
impl RemoteCollector for DemoUpstream {
    async fn fetch_org_listing(&self, org_code: &str) -> Result<RemoteListing> {
        if org_code != "KALYAN" {
            return Err(BatchError::org_not_found(org_code));
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        let batches = (1..=8)
            .map(|i| RemoteBatch {
                batch_name: Some(format!("Morning Batch {i}")),
                filename: Some(format!("week_{i}: notes.pdf")),
                size_bytes: Some(20_000 * i),
                ..RemoteBatch::new(format!("kal-{i:02}"))
            })
            .collect();
        Ok(RemoteListing {
            org_name: Some("Kalyan Coaching Centre".into()),
            batches,
        })
    }

    async fn fetch_batch_bytes(&self, batch_id: &str) -> Result<RemotePayload> {
        let n = self.file_requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        if n % 3 == 2 {
            return Err(BatchError::transient("fetch_batch_bytes", "connection reset by peer"));
        }
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.extend(std::iter::repeat(b'x').take(4096 + batch_id.len() * 100));
        Ok(RemotePayload { bytes, content_type: Some("application/pdf".into()) })
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batch_engine=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           batch-engine: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Wire the service
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring batch-engine...");
    let config = BatchEngineConfig::from_toml_str(
        r#"
        requests_per_period = 20
        period_secs = 1
        base_delay_ms = 50
        sync_concurrency = 3
        operation_timeout_secs = 30
        "#,
    )?;
    let store = Arc::new(SqlBlobStore::new("sqlite::memory:").await?);
    let upstream = Arc::new(DemoUpstream { file_requests: AtomicUsize::new(0) });
    let api = BatchApi::new(BatchService::new(config, upstream.clone(), store)?);
    println!("   ✅ Ready (SQLite blob store, 20 req/s, 3 sync workers)");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. List twice: remote, then memory tier
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📋 Listing KALYAN...");
    for attempt in ["cold", "warm"] {
        let start = Instant::now();
        let resp = api.get_batches_by_org_code("KALYAN", false).await;
        println!("   └─ {attempt}: {} ({:?})", resp.message, start.elapsed());
    }
    if let Some(listing) = api.get_batches_by_org_code("KALYAN", false).await.data {
        for b in listing.batches.iter().take(3) {
            println!("      • {} | {} | {}", b.batch_id, b.filename, b.file_size_formatted);
        }
    }

    let unknown = api.get_batches_by_org_code("NOSUCHORG", false).await;
    println!("   └─ NOSUCHORG: success={} errors={:?}", unknown.success, unknown.errors);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. One download through the flaky upstream
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⬇️  Downloading kal-01...");
    let resp = api.download_batch("kal-01", "KALYAN").await;
    if let Some(file) = &resp.data {
        println!("   └─ {} ({} bytes, {})", file.filename, file.file_data.len(), file.content_type);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Sync twice
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔄 Syncing KALYAN (transient failures are retried)...");
    for round in 1..=2 {
        let resp = api.sync_org_batches("KALYAN", false).await;
        if let Some(report) = resp.data {
            println!(
                "   └─ round {round}: {}/{} files, {} failed, {} transferred in {:.2}s",
                report.downloaded_files,
                report.total_files,
                report.failed_files,
                report.total_bytes_formatted,
                report.duration_seconds,
            );
        }
    }
    println!("   ⚡ Upstream file requests: {}", upstream.file_requests.load(Ordering::SeqCst));

    let info = api.get_batch_info("kal-05").await;
    if let Some(info) = info.data {
        println!("\n📍 kal-05: downloaded={} at {:?}", info.batch.summary.downloaded, info.batch.summary.downloaded_at);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    api.service().cache().flush().await;
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={sum:.4}", samples.len())
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
