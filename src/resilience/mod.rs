// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gating and recovery around remote fetches.

pub mod rate_limit;
pub mod retry;
pub mod single_flight;

pub use rate_limit::{RateLimitWindow, RateLimiter};
pub use retry::RetryPolicy;
pub use single_flight::SingleFlight;
