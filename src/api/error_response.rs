// Converts `EngineError` into the RFC-7807-shaped `Problem` response body
// (§6 Errors, §7 Error Handling Design) via `axum::response::IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::EngineError;
use crate::problem::Problem;

/// Wraps an `EngineError` with the request context `Problem::from_error`
/// needs; constructed once per request from `AppState::config.debug_mode`.
pub struct ApiError {
    pub error: EngineError,
    pub instance: Option<String>,
    pub debug_mode: bool,
}

impl ApiError {
    pub fn new(error: EngineError, instance: Option<String>, debug_mode: bool) -> Self {
        Self { error, instance, debug_mode }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = Problem::from_error(&self.error, self.instance, self.debug_mode);
        let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !self.error.is_recoverable() {
            tracing::error!(code = problem.code, "internal error serving request");
        }
        (status, Json(problem)).into_response()
    }
}
