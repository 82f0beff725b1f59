//! The admission controller.
//!
//! # State
//! One mutex guards the active set and the FIFO queue. Every decision
//! (admit, enqueue, release, drain) takes the lock once, mutates, and
//! releases it before any continuation is spawned or any log line written.
//!
//! # Per-request state machine
//! ```text
//! Arrived ──▶ Admitted ──────────────▶ Completed
//!    │            ▲
//!    ▼            │ drain (one per completion)
//! Queued ─────────┘
//!  (202 ack written on arrival)
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::{extract::Request, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{Instrument, Span};

use crate::admission::context::{Classification, Continuation, ExemptPaths, RequestContext};
use crate::admission::hook::{CompletionHook, ResponseChannel};
use crate::admission::id::RequestId;
use crate::admission::results::DeferredResults;
use crate::config::AdmissionConfig;
use crate::observability::metrics;

/// Fatal construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("admission capacity must be greater than zero")]
    ZeroCapacity,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

/// Where a queued request landed.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueTicket {
    pub request_id: RequestId,
    /// 1-based position at enqueue time.
    pub position: usize,
    pub estimated_wait_secs: f64,
}

/// Result of the first admission phase.
#[derive(Debug)]
pub enum Admission {
    /// Capacity was reserved (or the request is exempt). Pass the context
    /// to [`AdmissionController::resume`].
    Admitted(RequestContext),
    /// Queued; the acknowledgment has already been written.
    Enqueued(QueueTicket),
}

/// Result of [`AdmissionController::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Exempt,
    Admitted(RequestId),
    Queued(QueueTicket),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueAckData {
    position: usize,
    estimated_wait_seconds: f64,
    request_id: String,
    status: &'static str,
}

#[derive(Serialize)]
struct QueueAck {
    accepted: bool,
    message: &'static str,
    data: QueueAckData,
}

/// A request waiting for a slot.
struct QueuedRequest {
    id: RequestId,
    span: Span,
    enqueued_at: Instant,
    client: String,
    endpoint: String,
    request: Request,
    continuation: Continuation,
    channel: ResponseChannel,
}

#[derive(Default)]
struct GateState {
    active: HashSet<RequestId>,
    queue: VecDeque<QueuedRequest>,
}

/// Bounds concurrently processed requests and queues the overflow.
pub struct AdmissionController {
    capacity: usize,
    per_slot_wait_secs: f64,
    exempt: ExemptPaths,
    results: Option<Arc<DeferredResults>>,
    state: Mutex<GateState>,
    /// Woken whenever the gate becomes empty.
    idle: Notify,
}

impl AdmissionController {
    /// Controller with default exempt paths, a 2 second per-slot wait
    /// estimate and no result retention.
    pub fn new(capacity: usize) -> Result<Self, GateError> {
        if capacity == 0 {
            return Err(GateError::ZeroCapacity);
        }
        let defaults = AdmissionConfig::default();
        Ok(Self {
            capacity,
            per_slot_wait_secs: defaults.per_slot_wait_secs,
            exempt: ExemptPaths::default(),
            results: None,
            state: Mutex::new(GateState::default()),
            idle: Notify::new(),
        })
    }

    pub fn from_config(config: &AdmissionConfig) -> Result<Self, GateError> {
        let controller = Self::new(config.max_concurrent)?
            .with_exempt_paths(ExemptPaths::from_config(config))
            .with_per_slot_wait(config.per_slot_wait_secs);

        Ok(if config.retain_results {
            let ttl = Duration::from_secs(config.result_ttl_secs);
            let results = DeferredResults::new(ttl).with_max_bytes(config.max_result_bytes);
            controller.with_results(Arc::new(results))
        } else {
            controller
        })
    }

    pub fn with_exempt_paths(mut self, exempt: ExemptPaths) -> Self {
        self.exempt = exempt;
        self
    }

    pub fn with_per_slot_wait(mut self, secs: f64) -> Self {
        self.per_slot_wait_secs = secs;
        self
    }

    /// Park the results of drained requests in `results`.
    pub fn with_results(mut self, results: Arc<DeferredResults>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn results(&self) -> Option<&Arc<DeferredResults>> {
        self.results.as_ref()
    }

    pub fn classify(&self, path: &str) -> Classification {
        self.exempt.classify(path)
    }

    /// Reserve a slot or queue the request.
    ///
    /// When queueing, the 202 acknowledgment is written on the caller's
    /// channel before this returns; the continuation is not invoked.
    pub fn try_admit(&self, ctx: RequestContext) -> Admission {
        if ctx.classification == Classification::Exempt {
            metrics::record_admission("exempt");
            return Admission::Admitted(ctx);
        }

        let mut state = self.lock_state();

        if state.active.len() < self.capacity {
            state.active.insert(ctx.id);
            let (active, queued) = state.counts();
            drop(state);

            tracing::info!(
                request_id = %ctx.id,
                client = %ctx.client,
                endpoint = %ctx.endpoint,
                active,
                queued,
                "Processing immediately"
            );
            metrics::record_admission("immediate");
            metrics::set_gate_counts(active, queued);
            return Admission::Admitted(ctx);
        }

        let RequestContext {
            id,
            span,
            client,
            endpoint,
            request,
            continuation,
            mut channel,
            ..
        } = ctx;

        let position = state.queue.len() + 1;
        let ticket = QueueTicket {
            request_id: id,
            position,
            estimated_wait_secs: position as f64 * self.per_slot_wait_secs,
        };

        if let Some(results) = &self.results {
            results.register(id.short());
        }
        channel.deliver(acknowledgment(&ticket));

        state.queue.push_back(QueuedRequest {
            id,
            span,
            enqueued_at: Instant::now(),
            client: client.clone(),
            endpoint: endpoint.clone(),
            request,
            continuation,
            channel,
        });
        let (active, queued) = state.counts();
        drop(state);

        tracing::info!(
            request_id = %id,
            client = %client,
            endpoint = %endpoint,
            position,
            active,
            queued,
            "Adding to queue"
        );
        metrics::record_admission("queued");
        metrics::set_gate_counts(active, queued);
        Admission::Enqueued(ticket)
    }

    /// Run an admitted request's continuation with a completion hook in
    /// place of its raw channel.
    pub fn resume(self: &Arc<Self>, ctx: RequestContext) {
        let RequestContext {
            id,
            span,
            classification,
            request,
            continuation,
            channel,
            ..
        } = ctx;

        let hook = match classification {
            Classification::Exempt => CompletionHook::untracked(id, channel),
            Classification::Controlled => {
                CompletionHook::tracked(id, channel, Arc::clone(self), None)
            }
        };
        tokio::spawn(continuation(request, hook).instrument(span));
    }

    /// Both admission phases in one call.
    pub fn admit(self: &Arc<Self>, ctx: RequestContext) -> Decision {
        let id = ctx.id;
        let exempt = ctx.classification == Classification::Exempt;
        match self.try_admit(ctx) {
            Admission::Admitted(ctx) => {
                self.resume(ctx);
                if exempt {
                    Decision::Exempt
                } else {
                    Decision::Admitted(id)
                }
            }
            Admission::Enqueued(ticket) => Decision::Queued(ticket),
        }
    }

    /// Release `id` and drain at most one queued request into the freed
    /// slot. Unknown or already released ids are ignored.
    pub fn on_completion(self: &Arc<Self>, id: RequestId) {
        let mut state = self.lock_state();
        if !state.active.remove(&id) {
            return;
        }

        let next = if state.active.len() < self.capacity {
            state.queue.pop_front()
        } else {
            None
        };
        if let Some(entry) = &next {
            state.active.insert(entry.id);
        }
        let (active, queued) = state.counts();
        drop(state);

        tracing::info!(request_id = %id, active, queued, "Request completed");
        metrics::set_gate_counts(active, queued);
        if active == 0 && queued == 0 {
            self.idle.notify_waiters();
        }

        if let Some(entry) = next {
            self.resume_queued(entry, active, queued);
        }
    }

    fn resume_queued(self: &Arc<Self>, entry: QueuedRequest, active: usize, queued: usize) {
        let QueuedRequest {
            id,
            span,
            enqueued_at,
            client,
            endpoint,
            request,
            continuation,
            channel,
        } = entry;

        let waited = enqueued_at.elapsed();
        span.in_scope(|| {
            tracing::info!(
                request_id = %id,
                client = %client,
                endpoint = %endpoint,
                waited_ms = waited.as_millis() as u64,
                active,
                queued,
                "Processing from queue"
            )
        });
        metrics::record_admission("drained");
        metrics::record_queue_wait(waited);

        let deferred = self.results.as_ref().map(|r| r.slot(id.short()));
        let hook = CompletionHook::tracked(id, channel, Arc::clone(self), deferred);
        tokio::spawn(continuation(request, hook).instrument(span));
    }

    pub fn status(&self) -> GateStatus {
        let (active, queued) = self.lock_state().counts();
        GateStatus {
            active,
            queued,
            max_concurrent: self.capacity,
        }
    }

    /// Resolve once nothing is admitted or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (active, queued) = self.lock_state().counts();
            if active == 0 && queued == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Current 1-based queue position of the request whose truncated id is
    /// `short_id`, if it is still waiting.
    pub fn queue_position(&self, short_id: &str) -> Option<usize> {
        self.lock_state()
            .queue
            .iter()
            .position(|entry| entry.id.short() == short_id)
            .map(|index| index + 1)
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        // No code path panics while holding the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GateState {
    fn counts(&self) -> (usize, usize) {
        (self.active.len(), self.queue.len())
    }
}

fn acknowledgment(ticket: &QueueTicket) -> axum::response::Response {
    let body = QueueAck {
        accepted: true,
        message: "queued",
        data: QueueAckData {
            position: ticket.position,
            estimated_wait_seconds: ticket.estimated_wait_secs,
            request_id: ticket.request_id.short(),
            status: "waiting",
        },
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::hook::{Delivery, ResponseReceiver};
    use crate::admission::results::Lookup;
    use axum::body::Body;
    use serde_json::Value;
    use tokio::sync::{mpsc, oneshot};

    type Parked = mpsc::UnboundedReceiver<(String, CompletionHook)>;

    fn gate(capacity: usize) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(capacity).unwrap())
    }

    /// Continuation that hands its hook back to the test, which decides
    /// when the request completes.
    fn parked(tx: &mpsc::UnboundedSender<(String, CompletionHook)>) -> Continuation {
        let tx = tx.clone();
        Box::new(move |request, hook| {
            Box::pin(async move {
                let _ = tx.send((request.uri().path().to_string(), hook));
            })
        })
    }

    fn arrive(
        gate: &AdmissionController,
        path: &str,
        continuation: Continuation,
    ) -> (RequestContext, ResponseReceiver) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        RequestContext::new(request, "127.0.0.1", gate.classify(path), continuation)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_zero_capacity_is_fatal() {
        assert_eq!(AdmissionController::new(0).err(), Some(GateError::ZeroCapacity));
    }

    #[tokio::test]
    async fn test_capacity_three_scenario() {
        let gate = gate(3);
        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();

        let mut receivers = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let (ctx, rx) = arrive(&gate, path, parked(&tx));
            assert!(matches!(gate.admit(ctx), Decision::Admitted(_)));
            receivers.push(rx);
        }
        assert_eq!(gate.status(), GateStatus { active: 3, queued: 0, max_concurrent: 3 });

        let (ctx, d_rx) = arrive(&gate, "/d", parked(&tx));
        let d_id = ctx.id();
        match gate.admit(ctx) {
            Decision::Queued(ticket) => {
                assert_eq!(ticket.position, 1);
                assert_eq!(ticket.estimated_wait_secs, 2.0);
                assert_eq!(ticket.request_id, d_id);
            }
            other => panic!("expected D to queue, got {other:?}"),
        }
        assert_eq!(gate.status().queued, 1);

        let ack = d_rx.await.unwrap();
        assert_eq!(ack.status(), StatusCode::ACCEPTED);
        let ack = body_json(ack).await;
        assert_eq!(ack["accepted"], true);
        assert_eq!(ack["message"], "queued");
        assert_eq!(ack["data"]["position"], 1);
        assert_eq!(ack["data"]["estimatedWaitSeconds"], 2.0);
        assert_eq!(ack["data"]["requestId"], d_id.short());
        assert_eq!(ack["data"]["status"], "waiting");

        let mut hooks = Vec::new();
        for _ in 0..3 {
            hooks.push(parked_rx.recv().await.unwrap());
        }
        let index = hooks.iter().position(|(path, _)| path == "/a").unwrap();
        let (_, mut a_hook) = hooks.remove(index);
        assert_eq!(a_hook.end(), Delivery::Delivered);

        let (path, _d_hook) = parked_rx.recv().await.unwrap();
        assert_eq!(path, "/d");
        assert_eq!(gate.status(), GateStatus { active: 3, queued: 0, max_concurrent: 3 });
        assert_eq!(receivers.remove(0).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_disconnected_queued_caller_is_still_drained() {
        let gate = gate(1);
        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();

        let (a, _a_rx) = arrive(&gate, "/a", parked(&tx));
        gate.admit(a);

        let (ran_tx, ran_rx) = oneshot::channel();
        let writes_twice: Continuation = Box::new(move |_request, mut hook| {
            Box::pin(async move {
                let first = hook.end();
                let second = hook.end();
                let _ = ran_tx.send((first, second));
            })
        });
        let (b, b_rx) = arrive(&gate, "/b", writes_twice);
        assert!(matches!(gate.admit(b), Decision::Queued(QueueTicket { position: 1, .. })));
        drop(b_rx);

        let (_, mut a_hook) = parked_rx.recv().await.unwrap();
        a_hook.end();

        let (first, second) = ran_rx.await.unwrap();
        assert_eq!(first, Delivery::AlreadyCompleted);
        assert_eq!(second, Delivery::AlreadyCompleted);
        assert_eq!(gate.status(), GateStatus { active: 0, queued: 0, max_concurrent: 1 });
    }

    #[tokio::test]
    async fn test_drain_order_matches_arrival_order() {
        let gate = gate(1);
        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();

        let paths: Vec<String> = (0..=5).map(|tag| format!("/tag/{tag}")).collect();
        let mut acks = Vec::new();
        for path in &paths {
            let (ctx, rx) = arrive(&gate, path, parked(&tx));
            gate.admit(ctx);
            acks.push(rx);
        }
        assert_eq!(gate.status().queued, 5);

        let mut order = Vec::new();
        for _ in 0..paths.len() {
            let (path, mut hook) = parked_rx.recv().await.unwrap();
            order.push(path);
            hook.end();
        }
        assert_eq!(order, paths);
        assert_eq!(gate.status().active, 0);
    }

    #[tokio::test]
    async fn test_every_signal_releases_exactly_once() {
        let gate = gate(1);
        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();

        let mut receivers = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let (ctx, rx) = arrive(&gate, path, parked(&tx));
            gate.admit(ctx);
            receivers.push(rx);
        }

        let (_, mut a_hook) = parked_rx.recv().await.unwrap();
        a_hook.json(StatusCode::OK, &serde_json::json!({"n": 1}));
        a_hook.end();
        a_hook.finish();
        drop(a_hook);
        gate.on_completion(RequestId::generate());

        // only B was drained by A's completion
        let (path, b_hook) = parked_rx.recv().await.unwrap();
        assert_eq!(path, "/b");
        assert_eq!(gate.status(), GateStatus { active: 1, queued: 1, max_concurrent: 1 });

        // dropping without a write is the close signal
        drop(b_hook);
        let (path, _c_hook) = parked_rx.recv().await.unwrap();
        assert_eq!(path, "/c");
        assert_eq!(gate.status(), GateStatus { active: 1, queued: 0, max_concurrent: 1 });
    }

    #[tokio::test]
    async fn test_exempt_requests_skip_a_full_gate() {
        let gate = gate(1);
        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();

        let (a, _a_rx) = arrive(&gate, "/a", parked(&tx));
        gate.admit(a);
        let (b, _b_rx) = arrive(&gate, "/b", parked(&tx));
        gate.admit(b);
        let (_, _a_hook) = parked_rx.recv().await.unwrap();

        for path in ["/api/health", "/api/admin/allowed-macs"] {
            let (ctx, rx) = arrive(&gate, path, parked(&tx));
            assert_eq!(gate.admit(ctx), Decision::Exempt);

            let (parked_path, mut hook) = parked_rx.recv().await.unwrap();
            assert_eq!(parked_path, path);
            hook.end();
            assert_eq!(rx.await.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(gate.status(), GateStatus { active: 1, queued: 1, max_concurrent: 1 });
    }

    #[tokio::test]
    async fn test_active_plus_queued_tracks_outstanding_requests() {
        let gate = gate(2);
        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();
        let mut outstanding = 0usize;
        let mut hooks: VecDeque<CompletionHook> = VecDeque::new();
        let mut receivers = Vec::new();

        // arrivals (+) and completions (-) interleaved
        for step in "++++-+--+-+---".chars() {
            if step == '+' {
                let (ctx, rx) = arrive(&gate, "/otp", parked(&tx));
                gate.admit(ctx);
                receivers.push(rx);
                outstanding += 1;
            } else {
                while let Ok((_, hook)) = parked_rx.try_recv() {
                    hooks.push_back(hook);
                }
                if hooks.is_empty() {
                    let (_, hook) = parked_rx.recv().await.unwrap();
                    hooks.push_back(hook);
                }
                hooks.pop_front().unwrap().end();
                outstanding -= 1;
            }
            let status = gate.status();
            assert!(status.active <= status.max_concurrent);
            assert_eq!(status.active + status.queued, outstanding);
        }
        assert_eq!(outstanding, 0);
    }

    #[tokio::test]
    async fn test_retained_result_is_parked_for_polling() {
        let results = Arc::new(DeferredResults::new(Duration::from_secs(60)));
        let gate = Arc::new(
            AdmissionController::new(1)
                .unwrap()
                .with_results(Arc::clone(&results)),
        );
        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();

        let (a, _a_rx) = arrive(&gate, "/a", parked(&tx));
        gate.admit(a);

        let (b, _b_rx) = arrive(&gate, "/b", parked(&tx));
        let short = b.id().short();
        gate.admit(b);
        assert_eq!(gate.queue_position(&short), Some(1));
        assert!(matches!(results.take(&short), Lookup::Pending));

        let (_, mut a_hook) = parked_rx.recv().await.unwrap();
        assert_eq!(a_hook.end(), Delivery::Delivered);

        let (_, mut b_hook) = parked_rx.recv().await.unwrap();
        assert_eq!(gate.queue_position(&short), None);
        assert_eq!(
            b_hook.json(StatusCode::CREATED, &serde_json::json!({"otp": "ok"})),
            Delivery::Deferred
        );

        match results.take(&short) {
            Lookup::Ready(response) => {
                assert_eq!(response.status(), StatusCode::CREATED);
                assert_eq!(body_json(response).await["otp"], "ok");
            }
            _ => panic!("expected the drained result"),
        }
    }

    type SpanReport = (Option<tracing::Id>, CompletionHook);

    /// Continuation reporting the span it runs in.
    fn reports_span(tx: &mpsc::UnboundedSender<SpanReport>) -> Continuation {
        let tx = tx.clone();
        Box::new(move |_request, hook| {
            Box::pin(async move {
                let _ = tx.send((Span::current().id(), hook));
            })
        })
    }

    #[tokio::test]
    async fn test_continuations_run_in_the_arrival_span() {
        let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry());
        let gate = gate(1);
        let (tx, mut seen) = mpsc::unbounded_channel();

        let first = tracing::info_span!("first");
        let (a, _a_rx) = first.in_scope(|| arrive(&gate, "/a", reports_span(&tx)));
        first.in_scope(|| gate.admit(a));

        let second = tracing::info_span!("second");
        let (b, _b_rx) = second.in_scope(|| arrive(&gate, "/b", reports_span(&tx)));
        second.in_scope(|| gate.admit(b));

        let (span_id, mut a_hook) = seen.recv().await.unwrap();
        assert!(span_id.is_some());
        assert_eq!(span_id, first.id());

        // B is drained from A's completion, outside any span
        a_hook.end();
        let (span_id, _b_hook) = seen.recv().await.unwrap();
        assert_eq!(span_id, second.id());
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_once_the_queue_drains() {
        let gate = gate(1);
        gate.wait_idle().await;

        let (tx, mut parked_rx): (_, Parked) = mpsc::unbounded_channel();
        let (a, _a_rx) = arrive(&gate, "/a", parked(&tx));
        gate.admit(a);
        let (b, _b_rx) = arrive(&gate, "/b", parked(&tx));
        gate.admit(b);

        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.wait_idle().await }
        });

        let (_, mut a_hook) = parked_rx.recv().await.unwrap();
        a_hook.end();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let (_, mut b_hook) = parked_rx.recv().await.unwrap();
        b_hook.end();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gate.status(), GateStatus { active: 0, queued: 0, max_concurrent: 1 });
    }

    #[test]
    fn test_from_config() {
        let mut config = AdmissionConfig::default();
        config.max_concurrent = 5;
        config.admin_prefix = "/ops/".into();
        let gate = AdmissionController::from_config(&config).unwrap();
        assert_eq!(gate.capacity(), 5);
        assert!(gate.results().is_some());
        assert_eq!(gate.classify("/ops/drain"), Classification::Exempt);
        assert_eq!(gate.classify("/api/admin/add-mac"), Classification::Controlled);

        config.retain_results = false;
        assert!(AdmissionController::from_config(&config).unwrap().results().is_none());
    }
}
