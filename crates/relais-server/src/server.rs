//! Router assembly and serving.

use axum::{
    http::{header, Method},
    routing::{get, options, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{
    routes::{
        health_handler, mark_processed_handler, options_handler, pull_get_handler,
        pull_post_handler, stats_handler,
    },
    state::AppState,
};

/// Build the pull-API router with permissive CORS.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static("x-api-key")]);

    Router::new()
        .route("/api/webhooks/pull", get(pull_get_handler).post(pull_post_handler))
        .route("/api/webhooks/mark-processed", post(mark_processed_handler))
        .route("/api/webhooks/stats", get(stats_handler))
        .route("/api/webhooks/health", get(health_handler))
        .route("/api/webhooks/options", options(options_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    bind_addr: std::net::SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "pull API listening");
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use relais_core::{
        Engine, EngineConfig, EventOp, HttpDeliveryClient, MemoryStorage, NewEvent,
    };
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use super::*;

    async fn test_state() -> AppState {
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(HttpDeliveryClient::new().expect("client")),
        );
        for i in 1..=5 {
            engine
                .append_event(NewEvent::new("sale.order", i, EventOp::Create, json!({"n": i})))
                .await
                .expect("append");
        }
        AppState::new(engine, Some("secret".to_string()))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pending_events"], 5);
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn test_pull_requires_api_key() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks/pull?last_event_id=0")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], true);
        assert_eq!(body["message"], "Authentication required");
    }

    #[tokio::test]
    async fn test_pull_get_returns_batch() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks/pull?last_event_id=2&limit=2")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 2);
        assert_eq!(body["last_id"], 4);
        assert_eq!(body["has_more"], true);
        assert_eq!(body["events"][0]["id"], 3);
    }

    #[tokio::test]
    async fn test_pull_post_with_filters() {
        let router = build_router(test_state().await);
        let request_body = json!({
            "last_event_id": 0,
            "limit": 10,
            "models": ["sale.order"],
            "priority": "medium"
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/pull")
                    .header("x-api-key", "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(request_body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 5);
    }

    #[tokio::test]
    async fn test_pull_rejects_bad_priority() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks/pull?priority=urgent")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mark_processed_rejects_empty_list() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/mark-processed")
                    .header("x-api-key", "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"event_ids": []}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mark_processed_acknowledges_and_tracks_cursor() {
        let router = build_router(test_state().await);
        let request_body = json!({
            "event_ids": [1, 2, 3],
            "user_id": 7,
            "device_id": "device-a",
            "app_type": "sales_app"
        });
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/mark-processed")
                    .header("x-api-key", "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(request_body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["processed_count"], 3);

        // Acked events are gone from the next pull.
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks/pull?last_event_id=0&limit=10")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(body["count"], 2);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks/stats?days=30")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["stats"]["period_days"], 30);
        assert_eq!(body["stats"]["total"], 5);
        assert_eq!(body["stats"]["pending"], 5);
        assert_eq!(body["stats"]["by_model"][0]["model"], "sale.order");
    }

    #[tokio::test]
    async fn test_options_preflight() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/webhooks/options")
                    .header("origin", "https://consumer.example.com")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }
}
