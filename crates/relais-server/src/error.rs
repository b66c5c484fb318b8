//! API error responses.
//!
//! Every error body has the same stable shape:
//! `{"error": true, "message": "...", "timestamp": "..."}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use relais_core::PipelineError;
use serde_json::json;

/// Errors surfaced at the API boundary.
#[derive(Debug)]
pub enum ApiError {
    /// 400: malformed parameter or body
    BadRequest(String),
    /// 401: missing or wrong API key
    Unauthorized,
    /// 500: internal pipeline failure
    Internal(String),
    /// 503: health check failed
    Unhealthy(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => format!("Invalid parameter: {message}"),
            // No detail leakage on auth failures.
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::Internal(message) => format!("Internal server error: {message}"),
            ApiError::Unhealthy(message) => format!("Unhealthy: {message}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": true,
            "message": self.message(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        tracing::error!(error = %err, "pipeline error at API boundary");
        ApiError::Internal(err.to_string())
    }
}
