//! Subscriber endpoint descriptors.
//!
//! A subscriber is one external HTTP endpoint receiving push deliveries.
//! Operators prefer disabling over deleting: dispatch history references
//! subscribers by id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Authentication material for outbound requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthKind {
    /// No authentication
    #[default]
    None,
    /// HTTP Basic: `user:password` credentials, base64-encoded on the wire
    Basic {
        /// Raw `user:password` credentials
        credentials: String,
    },
    /// Bearer token
    Bearer {
        /// The token
        token: String,
    },
    /// API key in a named header
    ApiKey {
        /// Header name (e.g., `X-API-Key`)
        header: String,
        /// The key
        key:    String,
    },
}

/// One external HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    /// Subscriber id (assigned by storage)
    pub id:               i64,
    /// Descriptive name
    pub name:             String,
    /// Endpoint URL (http:// or https://)
    pub endpoint_url:     String,
    /// Authentication
    pub auth:             AuthKind,
    /// Per-request timeout in seconds
    pub timeout_secs:     u64,
    /// Verify TLS certificates
    pub verify_tls:       bool,
    /// Max successful deliveries per window, 0 = unlimited
    pub rate_limit:       u32,
    /// Rate-limit window in seconds
    pub rate_window_secs: u64,
    /// Extra headers merged into each request (cannot override auth)
    pub custom_headers:   HashMap<String, String>,
    /// Disabled subscribers receive nothing
    pub enabled:          bool,
    /// Retry budget for dispatches to this subscriber
    pub max_retries:      u32,
    /// Last successful delivery
    pub last_success_at:  Option<DateTime<Utc>>,
    /// Last failed delivery
    pub last_failure_at:  Option<DateTime<Utc>>,
}

impl Subscriber {
    /// A minimal enabled subscriber for the given endpoint.
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            id:               0,
            name:             name.into(),
            endpoint_url:     endpoint_url.into(),
            auth:             AuthKind::None,
            timeout_secs:     30,
            verify_tls:       true,
            rate_limit:       0,
            rate_window_secs: 60,
            custom_headers:   HashMap::new(),
            enabled:          true,
            max_retries:      5,
            last_success_at:  None,
            last_failure_at:  None,
        }
    }

    /// Validate the descriptor before persisting it.
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint_url.starts_with("http://") && !self.endpoint_url.starts_with("https://") {
            return Err(PipelineError::InvalidSubscriber {
                reason: format!(
                    "endpoint URL '{}' must start with http:// or https://",
                    self.endpoint_url
                ),
            });
        }
        if self.timeout_secs == 0 {
            return Err(PipelineError::InvalidSubscriber {
                reason: "timeout must be greater than 0".to_string(),
            });
        }
        if self.rate_limit > 0 && self.rate_window_secs == 0 {
            return Err(PipelineError::InvalidSubscriber {
                reason: "rate-limit window must be greater than 0".to_string(),
            });
        }
        if let AuthKind::ApiKey { header, .. } = &self.auth {
            if header.trim().is_empty() {
                return Err(PipelineError::InvalidSubscriber {
                    reason: "API-key header name must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}
