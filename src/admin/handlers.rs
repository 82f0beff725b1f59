use axum::{extract::State, Json};

use crate::admission::GateStatus;
use crate::http::server::AppState;

/// Current `{active, queued, maxConcurrent}` of the admission gate.
pub async fn get_concurrency_status(State(state): State<AppState>) -> Json<GateStatus> {
    Json(state.gate.status())
}
