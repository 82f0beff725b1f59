//! JSON response envelopes.
//!
//! Every locally generated body follows `{success, message?, data?}` so
//! clients can tell gate responses apart from passthrough upstream ones.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// `200 {success: true, data}`.
pub fn data_response<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        message: None,
        data: Some(data),
    })
    .into_response()
}

/// `{success: false, message}` with the given status.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body: Envelope<()> = Envelope {
        success: false,
        message: Some(message.into()),
        data: None,
    };
    (status, Json(body)).into_response()
}
