//! Deferred results for queued requests.
//!
//! A queued caller's channel is spent on the 202 acknowledgment, so the real
//! response produced after the drain can never travel on it. When result
//! retention is enabled the response is parked here, keyed by the truncated
//! request id from the acknowledgment, and handed out once on request.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::Response;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::AdmissionConfig;
use crate::http::response::error_response;

enum Deferred {
    Waiting,
    // Response<Body> is not Sync; the mutex makes the map shareable.
    Ready { response: Mutex<Response>, at: Instant },
}

/// Outcome of looking up a deferred result.
pub enum Lookup {
    /// Nothing registered under this id (never queued, already claimed or
    /// expired).
    Unknown,
    /// Registered but the downstream handler has not written yet.
    Pending,
    /// The stored response. It has been removed from the store.
    Ready(Response),
}

/// Store of responses produced for requests that were queued.
///
/// Stored bodies are fully buffered, so an unclaimed result holds memory
/// but no upstream connection.
pub struct DeferredResults {
    entries: DashMap<String, Deferred>,
    ttl: Duration,
    max_bytes: usize,
}

impl DeferredResults {
    /// Create a store that drops unclaimed results after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_bytes: AdmissionConfig::default().max_result_bytes,
        }
    }

    /// Cap on the body size of a stored result.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Reserve a slot for a request that has just been queued.
    pub fn register(&self, key: String) {
        self.entries.insert(key, Deferred::Waiting);
    }

    /// Handle used by the completion hook to fill the slot later.
    pub fn slot(self: &Arc<Self>, key: String) -> DeferredSlot {
        DeferredSlot {
            store: Arc::clone(self),
            key,
        }
    }

    /// Claim a result. Ready results are removed on retrieval; an expired
    /// one is removed and reported as unknown.
    pub fn take(&self, key: &str) -> Lookup {
        if let Some((_, Deferred::Ready { response, at })) = self
            .entries
            .remove_if(key, |_, d| matches!(d, Deferred::Ready { .. }))
        {
            if at.elapsed() >= self.ttl {
                return Lookup::Unknown;
            }
            return Lookup::Ready(response.into_inner().unwrap_or_else(PoisonError::into_inner));
        }

        if self.entries.contains_key(key) {
            Lookup::Pending
        } else {
            Lookup::Unknown
        }
    }

    /// Number of tracked entries, waiting or ready.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop ready results older than the TTL. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, d| match d {
            Deferred::Waiting => true,
            Deferred::Ready { at, .. } => at.elapsed() < ttl,
        });
        before.saturating_sub(self.entries.len())
    }

    /// Sweep periodically until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut ticker = time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dropped = self.sweep();
                    if dropped > 0 {
                        tracing::debug!(dropped, remaining = self.len(), "Expired deferred results dropped");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    fn fulfil(&self, key: &str, response: Response) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            *entry = Deferred::Ready {
                response: Mutex::new(response),
                at: Instant::now(),
            };
        }
    }
}

/// Write-once handle to one entry of [`DeferredResults`].
pub struct DeferredSlot {
    store: Arc<DeferredResults>,
    key: String,
}

impl DeferredSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_bytes(&self) -> usize {
        self.store.max_bytes
    }

    pub fn fulfil(self, response: Response) {
        self.store.fulfil(&self.key, response);
    }

    /// The handler finished without writing anything.
    pub fn abandon(self) {
        let response = error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Request completed without a response",
        );
        self.store.fulfil(&self.key, response);
    }
}
