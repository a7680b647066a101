// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The upstream content service, as seen by the engine.
//!
//! Implementations speak whatever wire protocol the upstream uses and map its
//! failures onto [`BatchError`]:
//!
//! | Upstream condition          | Error                                 |
//! |-----------------------------|---------------------------------------|
//! | unknown organization        | [`BatchError::OrgCodeNotFound`]       |
//! | unknown batch               | [`BatchError::BatchFileNotFound`]     |
//! | timeout, reset, 5xx         | [`BatchError::Transient`] (retried)   |
//! | upstream throttling (429)   | [`BatchError::RateLimitExceeded`]     |

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{RemoteListing, RemotePayload};

#[cfg(doc)]
use crate::error::BatchError;

#[async_trait]
pub trait RemoteCollector: Send + Sync {
    /// List every batch the upstream knows for `org_code`.
    async fn fetch_org_listing(&self, org_code: &str) -> Result<RemoteListing>;

    /// Download one batch's file.
    async fn fetch_batch_bytes(&self, batch_id: &str) -> Result<RemotePayload>;
}
