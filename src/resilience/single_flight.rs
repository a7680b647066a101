// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deduplication of concurrent identical fetches.
//!
//! The first caller for a key becomes the leader: its closure runs in a
//! spawned task and the result is published on a `watch` channel. Callers
//! arriving while the flight is airborne subscribe to the same channel and
//! receive a clone of the leader's result, value or error.
//!
//! ```text
//!  caller A ──► run("list:ABC") ──► spawn fetch ──┐
//!  caller B ──► run("list:ABC") ──► subscribe ────┤  one remote call
//!  caller C ──► run("list:ABC") ──► subscribe ────┤
//!                                                 ▼
//!                                 result broadcast to A, B, C; entry removed
//! ```
//!
//! The closure runs detached from any one caller, so a caller that times out
//! or is dropped simply stops waiting; the fetch carries on for everyone else.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::BatchError;

type FlightResult<T> = Option<Result<T, BatchError>>;

struct Flight<T> {
    id: u64,
    rx: watch::Receiver<FlightResult<T>>,
    waiters: Arc<AtomicUsize>,
}

/// Removes the map entry when the flight task finishes, panics, or is aborted.
struct FlightGuard<K: Eq + Hash, T> {
    calls: Arc<DashMap<K, Flight<T>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T> Drop for FlightGuard<K, T> {
    fn drop(&mut self) {
        let id = self.id;
        self.calls.remove_if(&self.key, |_, flight| flight.id == id);
    }
}

struct WaiterGuard(Arc<AtomicUsize>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Coordinator guaranteeing at most one in-flight execution per key.
pub struct SingleFlight<K: Eq + Hash, T> {
    calls: Arc<DashMap<K, Flight<T>>>,
    next_id: AtomicU64,
    executions: AtomicU64,
    joins: AtomicU64,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            executions: AtomicU64::new(0),
            joins: AtomicU64::new(0),
        }
    }

    /// Run `f` for `key`, or join the execution already in flight.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> Result<T, BatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BatchError>> + Send + 'static,
    {
        let (mut rx, waiters) = match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.joins.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_singleflight("joined");
                debug!(key = %key, "Joining in-flight fetch");
                let flight = entry.get();
                (flight.rx.clone(), flight.waiters.clone())
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                let waiters = Arc::new(AtomicUsize::new(0));
                entry.insert(Flight {
                    id,
                    rx: rx.clone(),
                    waiters: waiters.clone(),
                });

                self.executions.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_singleflight("leader");

                let guard = FlightGuard {
                    calls: self.calls.clone(),
                    key: key.clone(),
                    id,
                };
                tokio::spawn(async move {
                    let _guard = guard;
                    let result = f().await;
                    // No receivers left is fine: every caller detached
                    let _ = tx.send(Some(result));
                });
                (rx, waiters)
            }
        };

        waiters.fetch_add(1, Ordering::AcqRel);
        let _waiting = WaiterGuard(waiters);

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(published) => (*published).clone(),
            Err(_) => None,
        };

        outcome.unwrap_or_else(|| {
            warn!(key = %key, "In-flight fetch ended without a result");
            Err(BatchError::DownloadFailed {
                target: key.to_string(),
                reason: "in-flight fetch aborted".to_string(),
                attempts: 0,
            })
        })
    }

    /// Like [`run`](Self::run), but stop waiting at `deadline`.
    ///
    /// Only this caller gives up; the flight keeps running for other waiters.
    pub async fn run_until<F, Fut>(&self, key: K, deadline: Instant, f: F) -> Result<T, BatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BatchError>> + Send + 'static,
    {
        let started = Instant::now();
        let label = key.to_string();
        match timeout_at(deadline, self.run(key, f)).await {
            Ok(result) => result,
            Err(_) => Err(BatchError::Timeout {
                operation: label,
                after: deadline.saturating_duration_since(started),
            }),
        }
    }

    /// Number of keys with a fetch in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    /// Callers currently waiting on `key`, if a fetch is in flight
    #[must_use]
    pub fn waiters(&self, key: &K) -> Option<usize> {
        self.calls
            .get(key)
            .map(|flight| flight.waiters.load(Ordering::Acquire))
    }

    /// Closures actually executed
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Callers that piggybacked on someone else's execution
    #[must_use]
    pub fn joins(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
