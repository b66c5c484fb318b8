//! Health check and CORS preflight.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::{error::ApiError, state::AppState};

/// `GET /api/webhooks/health`
///
/// Public (no API key): load balancers and uptime probes hit this.
///
/// # Response Codes
///
/// - 200: storage reachable
/// - 503: pending-event count could not be read
pub async fn health_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    debug!("health check requested");

    let pending = state
        .engine
        .pending_events()
        .await
        .map_err(|e| ApiError::Unhealthy(e.to_string()))?;

    Ok(Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "pending_events": pending,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// `OPTIONS /api/webhooks/options`
///
/// CORS preflight; the CORS layer attaches the `Access-Control-Allow-*`
/// headers.
pub async fn options_handler() -> impl IntoResponse {
    StatusCode::OK
}
