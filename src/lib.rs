// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Batch Engine
//!
//! Retrieval and caching of organization batch files from a rate-limited
//! upstream service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         BatchApi                            │
//! │  • {success, message, errors} responses, never Err          │
//! │  • Per-operation deadline                                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       BatchService                          │
//! │  • list / download / sync / info / delete                   │
//! │  • Bounded worker pool for org sync                         │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌──────────────────────────┐      ┌──────────────────────────────┐
//! │       CacheManager       │      │   SingleFlight → Retry →     │
//! │  memory → filesystem →   │      │   RateLimiter → Remote       │
//! │  persistent (promotion)  │      │   (one fetch per key)        │
//! └──────────────────────────┘      └──────────────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 PersistentStore (ground truth)              │
//! │  • InMemoryStore, or SqlBlobStore over SQLite/MySQL         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use batch_engine::storage::InMemoryStore;
//! use batch_engine::{
//!     BatchApi, BatchEngineConfig, BatchService, RemoteBatch, RemoteCollector, RemoteListing,
//!     RemotePayload, Result,
//! };
//!
//! struct Upstream;
//!
//! #[async_trait]
//! impl RemoteCollector for Upstream {
//!     async fn fetch_org_listing(&self, _org_code: &str) -> Result<RemoteListing> {
//!         Ok(RemoteListing { org_name: Some("Kalyan".into()), batches: vec![RemoteBatch::new("b1")] })
//!     }
//!     async fn fetch_batch_bytes(&self, _batch_id: &str) -> Result<RemotePayload> {
//!         Ok(RemotePayload { bytes: b"%PDF-1.7".to_vec(), content_type: None })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let service = BatchService::new(
//!         BatchEngineConfig::default(),
//!         Arc::new(Upstream),
//!         Arc::new(InMemoryStore::new()),
//!     )?;
//!     let api = BatchApi::new(service);
//!
//!     let listing = api.get_batches_by_org_code("KALYAN", false).await;
//!     assert!(listing.success);
//!
//!     let file = api.download_batch("b1", "KALYAN").await;
//!     assert_eq!(file.data.unwrap().file_data, b"%PDF-1.7");
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`api`]: The [`BatchApi`] boundary
//! - [`service`]: [`BatchService`] orchestration
//! - [`cache`]: Tiered cache and [`CacheManager`]
//! - [`storage`]: Persistent stores (memory, SQL)
//! - [`resilience`]: Rate limiting, retry, single-flight
//! - [`remote`]: The upstream collaborator trait

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod remote;
pub mod resilience;
pub mod service;
pub mod storage;
pub mod validate;

pub use api::{ApiResponse, BatchApi, ErrorDescriptor};
pub use cache::{CacheKey, CacheManager, Tier, WriteOptions};
pub use config::BatchEngineConfig;
pub use error::{BatchError, Result};
pub use model::{
    BatchListing, BatchRecord, DownloadedFile, FileSource, OrgBatchSet, RemoteBatch, RemoteListing,
    RemotePayload, SyncFailure, SyncReport,
};
pub use remote::RemoteCollector;
pub use resilience::{RateLimiter, RetryPolicy, SingleFlight};
pub use service::BatchService;
pub use storage::{BlobHandle, InMemoryStore, PersistentStore, SqlBlobStore, StorageError};
