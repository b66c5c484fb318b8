//! Outbound HTTP delivery client.
//!
//! One POST per dispatch: JSON body, identifying `User-Agent`, auth
//! materialized from the subscriber descriptor, custom headers merged so
//! they can never override auth, a per-request timeout enforced at the
//! transport layer, and a TLS-verification toggle per subscriber.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    error::{DeliveryErrorKind, PipelineError, Result},
    subscriber::{AuthKind, Subscriber},
};

/// Identifies the pipeline to subscriber endpoints.
const USER_AGENT: &str = concat!("relais-webhook/", env!("CARGO_PKG_VERSION"));

/// Keep only this much of a response body for diagnostics.
const BODY_SUMMARY_LIMIT: usize = 512;

/// Successful delivery details.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// HTTP status code (2xx)
    pub status_code:  u16,
    /// Truncated response body for diagnostics
    pub body_summary: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms:  f64,
}

/// Delivery transport abstraction.
///
/// The dispatcher depends on this trait so tests can script outcomes
/// without a network (see [`crate::testing::MockTransport`]).
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Deliver one payload to one subscriber.
    async fn deliver(&self, subscriber: &Subscriber, payload: &Value) -> Result<DeliveryOutcome>;
}

/// reqwest-backed delivery transport.
pub struct HttpDeliveryClient {
    client:   Client,
    /// Separate client with certificate verification disabled, for
    /// subscribers that opt out of TLS verification.
    insecure: Client,
}

impl HttpDeliveryClient {
    /// Build the transport. Fails only if the TLS backend cannot initialize.
    pub fn new() -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build().map_err(|e| {
            PipelineError::DeliveryFailed {
                kind:    DeliveryErrorKind::Other,
                code:    None,
                message: format!("failed to build HTTP client: {e}"),
            }
        })?;
        let insecure = Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| PipelineError::DeliveryFailed {
                kind:    DeliveryErrorKind::Other,
                code:    None,
                message: format!("failed to build lax-TLS HTTP client: {e}"),
            })?;
        Ok(Self { client, insecure })
    }
}

#[async_trait]
impl DeliveryTransport for HttpDeliveryClient {
    async fn deliver(&self, subscriber: &Subscriber, payload: &Value) -> Result<DeliveryOutcome> {
        let start = std::time::Instant::now();

        let client = if subscriber.verify_tls { &self.client } else { &self.insecure };

        // Custom headers go in first with insert (replace) semantics, then
        // auth and content negotiation overwrite: a per-subscriber header
        // can never spoof or duplicate Authorization.
        let mut headers = HeaderMap::new();
        for (name, value) in &subscriber.custom_headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                warn!(subscriber = subscriber.id, header = %name, "skipping invalid custom header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                warn!(subscriber = subscriber.id, header = %name, "skipping invalid custom header value");
                continue;
            };
            headers.insert(name, value);
        }

        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        match &subscriber.auth {
            AuthKind::None => {},
            AuthKind::Basic { credentials } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    header_value(&format!("Basic {encoded}"))?,
                );
            },
            AuthKind::Bearer { token } => {
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    header_value(&format!("Bearer {token}"))?,
                );
            },
            AuthKind::ApiKey { header, key } => {
                let name = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                    PipelineError::DeliveryFailed {
                        kind:    DeliveryErrorKind::Other,
                        code:    None,
                        message: format!("invalid API-key header name '{header}': {e}"),
                    }
                })?;
                headers.insert(name, header_value(key)?);
            },
        }

        let request = client
            .post(&subscriber.endpoint_url)
            .timeout(Duration::from_secs(subscriber.timeout_secs))
            .headers(headers);

        debug!(
            subscriber = subscriber.id,
            url = %subscriber.endpoint_url,
            "delivering webhook payload"
        );

        let response = request.json(payload).send().await.map_err(|e| classify(&e))?;

        let status = response.status();
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let body = response.text().await.unwrap_or_default();
        let body_summary: String = body.chars().take(BODY_SUMMARY_LIMIT).collect();

        if status.is_success() {
            Ok(DeliveryOutcome {
                status_code: status.as_u16(),
                body_summary,
                duration_ms,
            })
        } else {
            let kind = if status.is_client_error() {
                DeliveryErrorKind::Http4xx
            } else if status.is_server_error() {
                DeliveryErrorKind::Http5xx
            } else {
                DeliveryErrorKind::Other
            };
            Err(PipelineError::DeliveryFailed {
                kind,
                code: Some(status.as_u16()),
                message: format!("endpoint answered HTTP {status}: {body_summary}"),
            })
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| PipelineError::DeliveryFailed {
        kind:    DeliveryErrorKind::Other,
        code:    None,
        message: format!("invalid header value: {e}"),
    })
}

/// A timeout is a timeout, not a connection error; the distinction drives
/// operator diagnostics.
fn classify(err: &reqwest::Error) -> PipelineError {
    let kind = if err.is_timeout() {
        DeliveryErrorKind::Timeout
    } else if err.is_connect() {
        DeliveryErrorKind::Connection
    } else {
        DeliveryErrorKind::Other
    };
    PipelineError::DeliveryFailed {
        kind,
        code: None,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn subscriber_for(server: &MockServer) -> Subscriber {
        Subscriber::new("test", format!("{}/hooks", server.uri()))
    }

    #[tokio::test]
    async fn test_success_posts_json_with_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header("content-type", "application/json"))
            .and(header("user-agent", USER_AGENT))
            .and(body_json(json!({"event": "create"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDeliveryClient::new().expect("client");
        let outcome = client
            .deliver(&subscriber_for(&server), &json!({"event": "create"}))
            .await
            .expect("delivery");

        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.body_summary, "ok");
    }

    #[tokio::test]
    async fn test_server_error_classified_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpDeliveryClient::new().expect("client");
        let err = client
            .deliver(&subscriber_for(&server), &json!({}))
            .await
            .expect_err("should fail");

        match err {
            PipelineError::DeliveryFailed { kind, code, .. } => {
                assert_eq!(kind, DeliveryErrorKind::Http5xx);
                assert_eq!(code, Some(500));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_client_error_classified_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpDeliveryClient::new().expect("client");
        let err = client
            .deliver(&subscriber_for(&server), &json!({}))
            .await
            .expect_err("should fail");

        assert!(matches!(
            err,
            PipelineError::DeliveryFailed {
                kind: DeliveryErrorKind::Http4xx,
                code: Some(404),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_timeout_classified_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut sub = subscriber_for(&server);
        sub.timeout_secs = 1;

        let client = HttpDeliveryClient::new().expect("client");
        let err = client.deliver(&sub, &json!({})).await.expect_err("should time out");

        assert!(matches!(
            err,
            PipelineError::DeliveryFailed {
                kind: DeliveryErrorKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connection_error_classified() {
        // Nothing listens on this port.
        let mut sub = Subscriber::new("dead", "http://127.0.0.1:1/hooks");
        sub.timeout_secs = 2;

        let client = HttpDeliveryClient::new().expect("client");
        let err = client.deliver(&sub, &json!({})).await.expect_err("should fail");

        assert!(matches!(
            err,
            PipelineError::DeliveryFailed {
                kind: DeliveryErrorKind::Connection,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_auth_materialization_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer tok-123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut sub = subscriber_for(&server);
        sub.auth = AuthKind::Bearer {
            token: "tok-123".to_string(),
        };

        let client = HttpDeliveryClient::new().expect("client");
        client.deliver(&sub, &json!({})).await.expect("delivery");
    }

    #[tokio::test]
    async fn test_auth_materialization_basic_and_api_key() {
        let server = MockServer::start().await;
        let expected = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("user:secret")
        );
        Mock::given(method("POST"))
            .and(header("authorization", expected.as_str()))
            .and(header("x-relay-key", "k-9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut sub = subscriber_for(&server);
        sub.auth = AuthKind::Basic {
            credentials: "user:secret".to_string(),
        };
        sub.custom_headers.insert("X-Relay-Key".to_string(), "k-9".to_string());

        let client = HttpDeliveryClient::new().expect("client");
        client.deliver(&sub, &json!({})).await.expect("delivery");
    }

    #[tokio::test]
    async fn test_custom_headers_cannot_override_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer real"))
            .and(header_exists("x-extra"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut sub = subscriber_for(&server);
        sub.auth = AuthKind::Bearer {
            token: "real".to_string(),
        };
        sub.custom_headers
            .insert("Authorization".to_string(), "Bearer spoofed".to_string());
        sub.custom_headers.insert("X-Extra".to_string(), "1".to_string());

        let client = HttpDeliveryClient::new().expect("client");
        client.deliver(&sub, &json!({})).await.expect("delivery");
    }
}
