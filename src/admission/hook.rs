//! Completion tracking for admitted requests.
//!
//! A downstream handler can signal that it is done in several ways: writing
//! a response (`send`, `json`, `end`), finishing without a write (`finish`),
//! or simply going away (the hook is dropped when the task ends, panics, or
//! is cancelled). [`CompletionHook`] funnels all of them into one cleanup
//! call per request id.

use std::sync::Arc;

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::admission::controller::AdmissionController;
use crate::admission::id::RequestId;
use crate::admission::results::DeferredSlot;
use crate::http::response::error_response;
use crate::observability::metrics;

/// Receiving end of a request's response channel.
pub type ResponseReceiver = oneshot::Receiver<Response>;

/// What happened to a terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the caller.
    Delivered,
    /// Dropped: the channel already carried a terminal write.
    AlreadyCompleted,
    /// Dropped: the caller is gone.
    Disconnected,
    /// The caller's channel was already spent on the queue acknowledgment;
    /// the response was parked in the deferred-result store.
    Deferred,
}

/// The caller's single-write response channel.
#[derive(Debug)]
pub struct ResponseChannel {
    tx: Option<oneshot::Sender<Response>>,
}

impl ResponseChannel {
    pub fn pair() -> (Self, ResponseReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Attempt the terminal write. Never fails; the outcome is reported.
    pub fn deliver(&mut self, response: Response) -> Delivery {
        match self.tx.take() {
            None => Delivery::AlreadyCompleted,
            Some(tx) => match tx.send(response) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Disconnected,
            },
        }
    }

    /// A terminal write has been attempted.
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }

    /// No further write can reach the caller.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Which signal completed a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    Send,
    Json,
    End,
    Finish,
    Close,
}

impl CompletionSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionSignal::Send => "send",
            CompletionSignal::Json => "json",
            CompletionSignal::End => "end",
            CompletionSignal::Finish => "finish",
            CompletionSignal::Close => "close",
        }
    }
}

/// Response surface handed to a downstream handler in place of the raw
/// channel. The first completion signal releases the request's slot; every
/// later signal, and every write after the first, is a no-op.
pub struct CompletionHook {
    id: RequestId,
    channel: ResponseChannel,
    deferred: Option<DeferredSlot>,
    tracker: Option<Arc<AdmissionController>>,
    fired: bool,
}

impl CompletionHook {
    /// Hook whose completion releases `id` in `controller`.
    pub(crate) fn tracked(
        id: RequestId,
        channel: ResponseChannel,
        controller: Arc<AdmissionController>,
        deferred: Option<DeferredSlot>,
    ) -> Self {
        Self {
            id,
            channel,
            deferred,
            tracker: Some(controller),
            fired: false,
        }
    }

    /// Hook for exempt requests: same write semantics, nothing to release.
    pub fn untracked(id: RequestId, channel: ResponseChannel) -> Self {
        Self {
            id,
            channel,
            deferred: None,
            tracker: None,
            fired: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// A completion signal has fired.
    pub fn is_completed(&self) -> bool {
        self.fired
    }

    /// The next write will be parked in the deferred-result store rather
    /// than reach a live caller.
    pub fn is_deferred(&self) -> bool {
        !self.fired && self.deferred.is_some() && self.channel.is_completed()
    }

    /// Write a full response.
    pub fn send(&mut self, response: Response) -> Delivery {
        self.write(response, CompletionSignal::Send)
    }

    /// Like [`send`](Self::send), but a response headed for the
    /// deferred-result store has its body read to the end first, releasing
    /// whatever connection is still producing it.
    pub async fn send_collected(&mut self, response: Response) -> Delivery {
        let Some(limit) = self.deferred.as_ref().map(DeferredSlot::max_bytes) else {
            return self.send(response);
        };
        if !self.is_deferred() {
            return self.send(response);
        }

        let (parts, body) = response.into_parts();
        let response = match axum::body::to_bytes(body, limit).await {
            Ok(bytes) => Response::from_parts(parts, Body::from(bytes)),
            Err(e) => {
                tracing::warn!(request_id = %self.id, error = %e, limit, "Deferred result body not stored");
                error_response(StatusCode::BAD_GATEWAY, "Response body could not be stored")
            }
        };
        self.write(response, CompletionSignal::Send)
    }

    /// Write a JSON body with the given status.
    pub fn json<T: Serialize>(&mut self, status: StatusCode, body: &T) -> Delivery {
        self.write((status, Json(body)).into_response(), CompletionSignal::Json)
    }

    /// Write an empty 200.
    pub fn end(&mut self) -> Delivery {
        self.write(StatusCode::OK.into_response(), CompletionSignal::End)
    }

    /// Stream finished without an explicit write.
    pub fn finish(&mut self) {
        self.complete(CompletionSignal::Finish);
    }

    fn write(&mut self, response: Response, signal: CompletionSignal) -> Delivery {
        if self.fired {
            tracing::debug!(request_id = %self.id, signal = signal.as_str(), "Dropping write after completion");
            return Delivery::AlreadyCompleted;
        }

        let delivery = match self.deferred.take() {
            Some(slot) if self.channel.is_completed() => {
                slot.fulfil(response);
                Delivery::Deferred
            }
            slot => {
                self.deferred = slot;
                self.channel.deliver(response)
            }
        };

        if delivery != Delivery::Delivered {
            tracing::debug!(request_id = %self.id, delivery = ?delivery, "Terminal write not delivered to caller");
        }

        self.complete(signal);
        delivery
    }

    fn complete(&mut self, signal: CompletionSignal) {
        if self.fired {
            return;
        }
        self.fired = true;

        if let Some(controller) = &self.tracker {
            metrics::record_completion(signal.as_str());
            controller.on_completion(self.id);
        }
    }
}

impl Drop for CompletionHook {
    fn drop(&mut self) {
        if let Some(slot) = self.deferred.take() {
            slot.abandon();
        }
        self.complete(CompletionSignal::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::results::{DeferredResults, Lookup};
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_write_wins() {
        let (channel, rx) = ResponseChannel::pair();
        let mut hook = CompletionHook::untracked(RequestId::generate(), channel);

        assert_eq!(hook.json(StatusCode::CREATED, &serde_json::json!({"ok": true})), Delivery::Delivered);
        assert!(hook.is_completed());
        assert_eq!(hook.end(), Delivery::AlreadyCompleted);
        assert_eq!(hook.send(StatusCode::IM_A_TEAPOT.into_response()), Delivery::AlreadyCompleted);

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_write_to_departed_caller_is_absorbed() {
        let (channel, rx) = ResponseChannel::pair();
        drop(rx);
        assert!(channel.is_closed());

        let mut hook = CompletionHook::untracked(RequestId::generate(), channel);
        assert_eq!(hook.end(), Delivery::Disconnected);
        assert!(hook.is_completed());
    }

    #[test]
    fn test_finish_blocks_later_writes() {
        let (channel, _rx) = ResponseChannel::pair();
        let mut hook = CompletionHook::untracked(RequestId::generate(), channel);
        hook.finish();
        hook.finish();
        assert_eq!(hook.end(), Delivery::AlreadyCompleted);
    }

    fn deferred_hook(max_bytes: usize) -> (CompletionHook, Arc<DeferredResults>, String) {
        let results = Arc::new(DeferredResults::new(Duration::from_secs(60)).with_max_bytes(max_bytes));
        let gate = Arc::new(AdmissionController::new(1).unwrap());
        let id = RequestId::generate();
        results.register(id.short());

        // the queue acknowledgment already spent the caller's channel
        let (mut channel, _rx) = ResponseChannel::pair();
        channel.deliver(StatusCode::ACCEPTED.into_response());

        let hook = CompletionHook::tracked(id, channel, gate, Some(results.slot(id.short())));
        (hook, results, id.short())
    }

    #[tokio::test]
    async fn test_deferred_body_is_buffered_before_parking() {
        let (mut hook, results, key) = deferred_hook(1024);
        assert!(hook.is_deferred());

        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>("{\"otp\":"),
            Ok("\"42\"}"),
        ]);
        let response = Response::new(Body::from_stream(chunks));
        assert_eq!(hook.send_collected(response).await, Delivery::Deferred);
        assert!(!hook.is_deferred());

        match results.take(&key) {
            Lookup::Ready(response) => {
                let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
                assert_eq!(&bytes[..], br#"{"otp":"42"}"#);
            }
            _ => panic!("expected a parked result"),
        }
    }

    #[tokio::test]
    async fn test_oversized_deferred_body_is_replaced() {
        let (mut hook, results, key) = deferred_hook(4);
        let response = (StatusCode::OK, "far more than four bytes").into_response();
        assert_eq!(hook.send_collected(response).await, Delivery::Deferred);

        match results.take(&key) {
            Lookup::Ready(response) => assert_eq!(response.status(), StatusCode::BAD_GATEWAY),
            _ => panic!("expected a parked result"),
        }
    }

    #[tokio::test]
    async fn test_live_caller_gets_the_body_unbuffered() {
        let (channel, rx) = ResponseChannel::pair();
        let mut hook = CompletionHook::untracked(RequestId::generate(), channel);
        assert!(!hook.is_deferred());
        assert_eq!(hook.send_collected(StatusCode::OK.into_response()).await, Delivery::Delivered);
        assert_eq!(rx.await.unwrap().status(), StatusCode::OK);
    }

    #[test]
    fn test_spent_channel_reports_already_completed() {
        let (mut channel, _rx) = ResponseChannel::pair();
        assert_eq!(channel.deliver(StatusCode::ACCEPTED.into_response()), Delivery::Delivered);
        assert!(channel.is_completed());
        assert_eq!(channel.deliver(StatusCode::OK.into_response()), Delivery::AlreadyCompleted);
    }
}
