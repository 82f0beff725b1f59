//! Local endpoints that are never queued: health, network diagnostics and
//! deferred-result polling.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::admission::{GateStatus, Lookup};
use crate::http::response::{data_response, error_response};
use crate::http::server::AppState;

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "message": "Admission gate is running",
        "platform": std::env::consts::OS,
        "timestamp": unix_millis(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInfo {
    #[serde(rename = "clientIP")]
    client_ip: Option<String>,
    #[serde(rename = "cleanIP")]
    clean_ip: Option<String>,
    platform: &'static str,
    gate: GateStatus,
    timestamp: u64,
}

/// Strip the IPv4-mapped IPv6 prefix so `::ffff:10.0.0.5` reads `10.0.0.5`.
fn clean_ip(raw: &str) -> &str {
    raw.strip_prefix("::ffff:").unwrap_or(raw)
}

pub async fn network_info(State(state): State<AppState>, request: Request) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let clean = client_ip.as_deref().map(|ip| clean_ip(ip).to_string());

    data_response(NetworkInfo {
        client_ip,
        clean_ip: clean,
        platform: std::env::consts::OS,
        gate: state.gate.status(),
        timestamp: unix_millis(),
    })
}

/// Fetch the result of a request that was queued.
///
/// - ready: the stored response, handed out once
/// - still queued: 202 with the current position
/// - running: 202 `processing`
/// - unknown, claimed or expired: 404
pub async fn deferred_result(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    let Some(results) = state.gate.results() else {
        return error_response(StatusCode::NOT_FOUND, "Result retention is disabled");
    };

    match results.take(&request_id) {
        Lookup::Ready(response) => response,
        Lookup::Pending => {
            let body = match state.gate.queue_position(&request_id) {
                Some(position) => json!({
                    "success": true,
                    "data": { "requestId": request_id, "status": "waiting", "position": position },
                }),
                None => json!({
                    "success": true,
                    "data": { "requestId": request_id, "status": "processing" },
                }),
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Lookup::Unknown => error_response(StatusCode::NOT_FOUND, "Unknown or expired request id"),
    }
}
