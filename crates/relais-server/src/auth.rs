//! Shared-secret authentication for the pull surface.

use axum::http::HeaderMap;

use crate::{error::ApiError, state::AppState};

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Validate the `X-API-Key` header against the configured secret.
///
/// A server without a configured key rejects everything: an unauthenticated
/// pull surface is never the right default.
pub fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        tracing::warn!("no API key configured, rejecting request");
        return Err(ApiError::Unauthorized);
    };

    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    match presented {
        Some(key) if key == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::HeaderValue;
    use relais_core::{Engine, EngineConfig, HttpDeliveryClient, MemoryStorage};

    use super::*;

    fn state(api_key: Option<&str>) -> AppState {
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(HttpDeliveryClient::new().expect("client")),
        );
        AppState::new(engine, api_key.map(ToString::to_string))
    }

    #[test]
    fn test_matching_key_passes() {
        let state = state(Some("secret"));
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(require_api_key(&state, &headers).is_ok());
    }

    #[test]
    fn test_wrong_or_missing_key_rejected() {
        let state = state(Some("secret"));

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("nope"));
        assert!(require_api_key(&state, &headers).is_err());

        assert!(require_api_key(&state, &HeaderMap::new()).is_err());
    }

    #[test]
    fn test_unconfigured_key_rejects_all() {
        let state = state(None);
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("anything"));
        assert!(require_api_key(&state, &headers).is_err());
    }
}
