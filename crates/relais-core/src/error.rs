//! Pipeline error types and error code definitions.

use thiserror::Error;

/// Pipeline error type with structured error codes.
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    /// RL001: Tracking rule configuration is invalid
    #[error("RL001: Invalid tracking rule: {message}")]
    InvalidRule {
        /// Detailed error message
        message: String,
    },

    /// RL002: Record filter syntax is invalid
    #[error("RL002: Invalid filter syntax: {reason}")]
    InvalidFilter {
        /// Reason for invalid filter
        reason: String,
    },

    /// RL003: Record filter evaluation failed
    #[error("RL003: Filter evaluation failed: {reason}")]
    FilterEvaluationFailed {
        /// Reason for evaluation failure
        reason: String,
    },

    /// RL004: Subscriber configuration is invalid
    #[error("RL004: Invalid subscriber configuration: {reason}")]
    InvalidSubscriber {
        /// Reason for invalid configuration
        reason: String,
    },

    /// RL005: Template rendering failed
    #[error("RL005: Template rendering failed: {reason}")]
    TemplateRenderingFailed {
        /// Reason for rendering failure
        reason: String,
    },

    /// RL006: Event log append rejected the event
    #[error("RL006: Event append rejected: {reason}")]
    AppendRejected {
        /// Reason the event was rejected
        reason: String,
    },

    /// RL007: Storage operation failed
    #[error("RL007: Storage operation failed: {reason}")]
    StorageError {
        /// Reason for storage failure
        reason: String,
    },

    /// RL008: Webhook delivery failed
    #[error("RL008: Delivery failed ({kind}): {message}")]
    DeliveryFailed {
        /// Classified failure kind
        kind:    DeliveryErrorKind,
        /// HTTP status code, when the endpoint answered
        code:    Option<u16>,
        /// Detailed error message
        message: String,
    },

    /// RL009: Retry budget exhausted, dispatch is dead
    #[error("RL009: Retries exhausted: {reason}")]
    RetriesExhausted {
        /// Reason for retry exhaustion
        reason: String,
    },

    /// RL010: Subscriber rate limit reached
    #[error("RL010: Subscriber {subscriber_id} rate limit reached")]
    RateLimited {
        /// The rate-limited subscriber
        subscriber_id: i64,
    },

    /// RL011: Dispatch record was not in a claimable state
    #[error("RL011: Dispatch {dispatch_id} cannot transition from '{status}'")]
    InvalidTransition {
        /// The dispatch record
        dispatch_id: i64,
        /// Its current status
        status:      String,
    },

    /// RL012: Engine is shutting down
    #[error("RL012: Engine is shutting down")]
    EngineShutdown,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Database query/connection error (from sqlx)
    #[cfg(feature = "postgres")]
    #[error("Database query error: {0}")]
    SqlxError(String),
}

/// Classified delivery failure, persisted with each failed dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    /// The request exceeded the per-request timeout
    Timeout,
    /// The endpoint could not be reached
    Connection,
    /// The endpoint answered with a 4xx status
    Http4xx,
    /// The endpoint answered with a 5xx status
    Http5xx,
    /// Anything else (DNS, TLS, body encoding, ...)
    Other,
}

impl DeliveryErrorKind {
    /// Stable string form used in persisted error records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DeliveryErrorKind::Timeout => "timeout",
            DeliveryErrorKind::Connection => "connection",
            DeliveryErrorKind::Http4xx => "http_4xx",
            DeliveryErrorKind::Http5xx => "http_5xx",
            DeliveryErrorKind::Other => "other",
        }
    }

    /// Whether a failure of this kind should be retried.
    ///
    /// Everything is retryable by default; operators may opt 4xx responses
    /// out (a client error rarely heals on its own).
    #[must_use]
    pub const fn is_retryable(self, retry_client_errors: bool) -> bool {
        match self {
            DeliveryErrorKind::Http4xx => retry_client_errors,
            _ => true,
        }
    }
}

impl std::fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryErrorKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timeout" => Ok(DeliveryErrorKind::Timeout),
            "connection" => Ok(DeliveryErrorKind::Connection),
            "http_4xx" => Ok(DeliveryErrorKind::Http4xx),
            "http_5xx" => Ok(DeliveryErrorKind::Http5xx),
            "other" => Ok(DeliveryErrorKind::Other),
            other => Err(PipelineError::SerializationError(format!(
                "unknown delivery error kind '{other}'"
            ))),
        }
    }
}

/// Error code with classification for retry/sink decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorCode {
    /// RL001: Invalid tracking rule
    InvalidRule,
    /// RL002: Invalid filter syntax
    InvalidFilter,
    /// RL003: Filter evaluation failed
    FilterEvaluationFailed,
    /// RL004: Invalid subscriber configuration
    InvalidSubscriber,
    /// RL005: Template rendering failed
    TemplateRenderingFailed,
    /// RL006: Event append rejected
    AppendRejected,
    /// RL007: Storage operation failed
    StorageError,
    /// RL008: Delivery failed
    DeliveryFailed,
    /// RL009: Retries exhausted
    RetriesExhausted,
    /// RL010: Rate limited
    RateLimited,
    /// RL011: Invalid dispatch transition
    InvalidTransition,
    /// RL012: Engine shutting down
    EngineShutdown,
}

impl PipelineErrorCode {
    /// Returns true if this error is transient (retryable).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            PipelineErrorCode::StorageError
                | PipelineErrorCode::DeliveryFailed
                | PipelineErrorCode::RateLimited
        )
    }
}

impl PipelineError {
    /// Get the error code for this error.
    #[must_use]
    pub const fn code(&self) -> PipelineErrorCode {
        match self {
            PipelineError::InvalidRule { .. } => PipelineErrorCode::InvalidRule,
            PipelineError::InvalidFilter { .. } => PipelineErrorCode::InvalidFilter,
            PipelineError::FilterEvaluationFailed { .. } => {
                PipelineErrorCode::FilterEvaluationFailed
            },
            PipelineError::InvalidSubscriber { .. } => PipelineErrorCode::InvalidSubscriber,
            PipelineError::TemplateRenderingFailed { .. } => {
                PipelineErrorCode::TemplateRenderingFailed
            },
            PipelineError::AppendRejected { .. } => PipelineErrorCode::AppendRejected,
            PipelineError::StorageError { .. } => PipelineErrorCode::StorageError,
            PipelineError::DeliveryFailed { .. } => PipelineErrorCode::DeliveryFailed,
            PipelineError::RetriesExhausted { .. } => PipelineErrorCode::RetriesExhausted,
            PipelineError::RateLimited { .. } => PipelineErrorCode::RateLimited,
            PipelineError::InvalidTransition { .. } => PipelineErrorCode::InvalidTransition,
            PipelineError::EngineShutdown => PipelineErrorCode::EngineShutdown,
            PipelineError::SerializationError(_) => PipelineErrorCode::InvalidRule,
            #[cfg(feature = "postgres")]
            PipelineError::SqlxError(_) => PipelineErrorCode::StorageError,
        }
    }

    /// Returns true if this error is transient (retryable).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code().is_transient()
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::SqlxError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_transient() {
        assert!(PipelineErrorCode::StorageError.is_transient());
        assert!(PipelineErrorCode::DeliveryFailed.is_transient());
        assert!(PipelineErrorCode::RateLimited.is_transient());

        assert!(!PipelineErrorCode::InvalidRule.is_transient());
        assert!(!PipelineErrorCode::RetriesExhausted.is_transient());
        assert!(!PipelineErrorCode::AppendRejected.is_transient());
    }

    #[test]
    fn test_delivery_error_kind_str_round_trip() {
        for kind in [
            DeliveryErrorKind::Timeout,
            DeliveryErrorKind::Connection,
            DeliveryErrorKind::Http4xx,
            DeliveryErrorKind::Http5xx,
            DeliveryErrorKind::Other,
        ] {
            let parsed: DeliveryErrorKind = kind.as_str().parse().expect("parse back");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_http_4xx_retry_opt_out() {
        assert!(DeliveryErrorKind::Http4xx.is_retryable(true));
        assert!(!DeliveryErrorKind::Http4xx.is_retryable(false));
        assert!(DeliveryErrorKind::Http5xx.is_retryable(false));
        assert!(DeliveryErrorKind::Timeout.is_retryable(false));
    }

    #[test]
    fn test_pipeline_error_code_method() {
        let err = PipelineError::InvalidRule {
            message: "duplicate".to_string(),
        };
        assert_eq!(err.code(), PipelineErrorCode::InvalidRule);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_delivery_failure() {
        let err = PipelineError::DeliveryFailed {
            kind:    DeliveryErrorKind::Connection,
            code:    None,
            message: "connection refused".to_string(),
        };
        assert!(err.is_transient());
    }
}
