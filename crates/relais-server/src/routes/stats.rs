//! Aggregate pipeline statistics.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{auth::require_api_key, error::ApiError, state::AppState};

/// Query parameters for `GET /api/webhooks/stats`.
#[derive(Debug, Deserialize)]
pub struct StatsParams {
    /// Trailing window in days (default 7).
    pub days: Option<u32>,
}

/// `GET /api/webhooks/stats`
pub async fn stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StatsParams>,
) -> Result<Json<Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let days = params.days.unwrap_or(7);
    let stats = state.engine.stats(days).await?;

    Ok(Json(json!({
        "success": true,
        "stats": stats,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}
