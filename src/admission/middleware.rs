//! Axum middleware placing the admission controller in front of a router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::admission::context::{continuation_from_next, Classification, RequestContext};
use crate::admission::controller::AdmissionController;
use crate::http::response::error_response;
use crate::observability::metrics;

/// Gate every controlled request through `gate`.
///
/// Exempt paths run straight through. Everything else waits for whatever
/// lands first on its channel: the handler's response when admitted, or the
/// 202 acknowledgment when queued.
pub async fn admission_middleware(
    State(gate): State<Arc<AdmissionController>>,
    request: Request,
    next: Next,
) -> Response {
    let classification = gate.classify(request.uri().path());
    if classification == Classification::Exempt {
        tracing::debug!(endpoint = %request.uri().path(), "Exempt from admission");
        metrics::record_admission("exempt");
        return next.run(request).await;
    }

    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let (ctx, receiver) =
        RequestContext::new(request, client, classification, continuation_from_next(next));
    gate.admit(ctx);

    match receiver.await {
        Ok(response) => response,
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Request completed without a response",
        ),
    }
}
