//! Cursor-based event pull.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use relais_core::{Priority, PullQuery};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{auth::require_api_key, error::ApiError, state::AppState};

/// Query parameters for `GET /api/webhooks/pull`.
#[derive(Debug, Deserialize)]
pub struct PullParams {
    /// Cursor: return events with id greater than this.
    #[serde(default)]
    pub last_event_id: i64,
    /// Batch size (capped at 1000).
    pub limit:         Option<usize>,
    /// Comma-separated model filter.
    pub models:        Option<String>,
    /// Priority filter.
    pub priority:      Option<String>,
}

/// JSON body for `POST /api/webhooks/pull`.
#[derive(Debug, Deserialize)]
pub struct PullBody {
    /// Cursor: return events with id greater than this.
    #[serde(default)]
    pub last_event_id: i64,
    /// Batch size (capped at 1000).
    pub limit:         Option<usize>,
    /// Model filter: JSON array or comma-separated string.
    pub models:        Option<ModelsFilter>,
    /// Priority filter.
    pub priority:      Option<String>,
}

/// Model filter accepted as an array or a comma-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ModelsFilter {
    /// `["sale.order", "res.partner"]`
    List(Vec<String>),
    /// `"sale.order,res.partner"`
    Csv(String),
}

impl ModelsFilter {
    fn into_list(self) -> Vec<String> {
        match self {
            ModelsFilter::List(models) => models,
            ModelsFilter::Csv(raw) => split_csv(&raw),
        }
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(ToString::to_string).collect()
}

fn parse_priority(raw: Option<&str>) -> Result<Option<Priority>, ApiError> {
    match raw {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("unknown priority '{value}'"))),
    }
}

async fn run_pull(state: &AppState, query: PullQuery) -> Result<Json<Value>, ApiError> {
    debug!(
        last_event_id = query.last_event_id,
        limit = query.limit,
        "pull request"
    );

    let batch = state.engine.pull_events(&query).await?;

    Ok(Json(json!({
        "success": true,
        "events": batch.events,
        "last_id": batch.last_id,
        "has_more": batch.has_more,
        "count": batch.count,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// `GET /api/webhooks/pull`
pub async fn pull_get_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PullParams>,
) -> Result<Json<Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let mut query = PullQuery::new(params.last_event_id, params.limit.unwrap_or(100));
    if let Some(models) = params.models.as_deref() {
        query = query.with_models(split_csv(models));
    }
    if let Some(priority) = parse_priority(params.priority.as_deref())? {
        query = query.with_priority(priority);
    }

    run_pull(&state, query).await
}

/// `POST /api/webhooks/pull`
pub async fn pull_post_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PullBody>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let Json(body) = body.map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;

    let mut query = PullQuery::new(body.last_event_id, body.limit.unwrap_or(100));
    if let Some(models) = body.models {
        query = query.with_models(models.into_list());
    }
    if let Some(priority) = parse_priority(body.priority.as_deref())? {
        query = query.with_priority(priority);
    }

    run_pull(&state, query).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv_trims_and_drops_empty() {
        assert_eq!(
            split_csv("sale.order, res.partner ,,"),
            vec!["sale.order".to_string(), "res.partner".to_string()]
        );
    }

    #[test]
    fn test_models_filter_both_shapes() {
        let list: ModelsFilter = serde_json::from_str(r#"["a", "b"]"#).expect("list");
        assert_eq!(list.into_list(), vec!["a".to_string(), "b".to_string()]);

        let csv: ModelsFilter = serde_json::from_str(r#""a,b""#).expect("csv");
        assert_eq!(csv.into_list(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(parse_priority(Some("high")).expect("ok"), Some(Priority::High));
        assert_eq!(parse_priority(None).expect("ok"), None);
        assert!(parse_priority(Some("urgent")).is_err());
    }
}
