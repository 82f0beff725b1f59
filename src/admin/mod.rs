//! Operator-facing endpoints. Everything under the admin prefix bypasses
//! admission, so these stay reachable while the gate is saturated.

pub mod handlers;

use axum::{routing::get, Router};

use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(prefix: &str) -> Router<AppState> {
    Router::new().route(
        &format!("{prefix}concurrency-status"),
        get(get_concurrency_status),
    )
}
