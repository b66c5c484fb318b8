//! Event acknowledgement.

use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{auth::require_api_key, error::ApiError, state::AppState};

/// JSON body for `POST /api/webhooks/mark-processed`.
#[derive(Debug, Deserialize)]
pub struct MarkProcessedBody {
    /// Event ids to acknowledge (must be non-empty).
    #[serde(default)]
    pub event_ids: Vec<i64>,
    /// Consumer identity for cursor tracking (optional, all three fields
    /// required together).
    pub user_id:   Option<i64>,
    /// Device identifier for cursor tracking.
    pub device_id: Option<String>,
    /// Consumer application kind.
    pub app_type:  Option<String>,
}

/// `POST /api/webhooks/mark-processed`
pub async fn mark_processed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<MarkProcessedBody>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let Json(body) = body.map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;

    if body.event_ids.is_empty() {
        return Err(ApiError::BadRequest(
            "event_ids must be a non-empty list".to_string(),
        ));
    }

    info!(count = body.event_ids.len(), "acknowledging events");
    let processed = state.engine.mark_processed(&body.event_ids).await?;

    // Advance the device cursor when the consumer identifies itself.
    if let (Some(user_id), Some(device_id)) = (body.user_id, body.device_id.as_deref()) {
        let app_type = body.app_type.as_deref().unwrap_or("mobile_app");
        let last_id = body.event_ids.iter().copied().max().unwrap_or(0);
        let state_row = state
            .engine
            .record_ack_cursor(user_id, device_id, app_type, last_id, processed)
            .await?;
        debug!(
            user_id,
            device_id,
            last_event_id = state_row.last_event_id,
            "sync cursor advanced"
        );
    }

    Ok(Json(json!({
        "success": true,
        "processed_count": processed,
        "message": format!("{processed} event(s) marked as processed"),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}
