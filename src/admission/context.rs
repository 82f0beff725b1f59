//! Arrival records and path classification.

use std::fmt;
use std::time::Instant;

use axum::{extract::Request, middleware::Next};
use futures_util::future::BoxFuture;
use tracing::Span;

use crate::admission::hook::{CompletionHook, ResponseChannel, ResponseReceiver};
use crate::admission::id::RequestId;
use crate::config::AdmissionConfig;

/// Whether a request goes through admission control at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Bypasses admission unconditionally.
    Exempt,
    /// Counted against capacity; may be queued.
    Controlled,
}

/// Paths that are never load-shed: health probe, diagnostics, anything
/// administrative, and deferred-result polling.
#[derive(Debug, Clone)]
pub struct ExemptPaths {
    health: String,
    diagnostic: String,
    admin_prefix: String,
    results_prefix: String,
}

impl ExemptPaths {
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            health: config.health_path.clone(),
            diagnostic: config.diagnostic_path.clone(),
            admin_prefix: config.admin_prefix.clone(),
            results_prefix: config.results_prefix.clone(),
        }
    }

    pub fn classify(&self, path: &str) -> Classification {
        if path == self.health
            || path == self.diagnostic
            || path.starts_with(&self.admin_prefix)
            || path.starts_with(&self.results_prefix)
        {
            Classification::Exempt
        } else {
            Classification::Controlled
        }
    }
}

impl Default for ExemptPaths {
    fn default() -> Self {
        Self::from_config(&AdmissionConfig::default())
    }
}

/// The downstream handler, deferred until the request is admitted.
///
/// It receives the original request and a [`CompletionHook`] standing in for
/// the raw response channel, and must complete the hook exactly once.
pub type Continuation = Box<dyn FnOnce(Request, CompletionHook) -> BoxFuture<'static, ()> + Send>;

/// Wrap the rest of an Axum middleware stack as a [`Continuation`].
pub fn continuation_from_next(next: Next) -> Continuation {
    Box::new(move |request, mut hook| {
        Box::pin(async move {
            let response = next.run(request).await;
            hook.send_collected(response).await;
        })
    })
}

/// Everything known about one arrival.
pub struct RequestContext {
    pub(crate) id: RequestId,
    /// Span current at arrival; the continuation runs inside it, even when
    /// it is drained from another request's completion.
    pub(crate) span: Span,
    pub(crate) arrived_at: Instant,
    pub(crate) classification: Classification,
    pub(crate) client: String,
    pub(crate) endpoint: String,
    pub(crate) request: Request,
    pub(crate) continuation: Continuation,
    pub(crate) channel: ResponseChannel,
}

impl RequestContext {
    /// Record an arrival. The returned receiver yields whatever is written
    /// first on the request's channel: the real response or the queue
    /// acknowledgment.
    pub fn new(
        request: Request,
        client: impl Into<String>,
        classification: Classification,
        continuation: Continuation,
    ) -> (Self, ResponseReceiver) {
        let (channel, receiver) = ResponseChannel::pair();
        let ctx = Self {
            id: RequestId::generate(),
            span: Span::current(),
            arrived_at: Instant::now(),
            classification,
            client: client.into(),
            endpoint: request.uri().path().to_string(),
            request,
            continuation,
            channel,
        };
        (ctx, receiver)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("classification", &self.classification)
            .field("client", &self.client)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
