//! JSON status bodies returned by the local HTTP servers.

use std::panic::Location;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const STATUS_KIND: &str = "RequestStatus";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub kind: String,
    pub message: String,
    pub code: u16,
}

impl RequestStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: STATUS_KIND.to_string(),
            message: message.into(),
            code: code.as_u16(),
        }
    }
}

impl IntoResponse for RequestStatus {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(self)).into_response()
    }
}

/// Builds a [`RequestStatus`] response. Failures are logged together with the
/// location of the call site.
#[track_caller]
pub fn write_status(code: StatusCode, message: impl Into<String>) -> Response {
    let status = RequestStatus::new(code, message);
    if !code.is_success() {
        let caller = Location::caller();
        info!(code = status.code, message = %status.message, %caller, "HTTP request failed");
    }
    status.into_response()
}
