//! Push dispatch queue: per-subscriber delivery records and the engine that
//! drives them through their status state machine.
//!
//! ```text
//!             process (claim)
//! pending ───────────────────▶ processing
//!    ▲                             │
//!    │ schedule_retry              │ 2xx
//!    │                             ▼
//! failed ◀──── delivery error ── sent  (terminal)
//!    │
//!    │ retry_count ≥ max_retries
//!    ▼
//! dead (terminal) ── dead letter created
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditAction, AuditRecord},
    config::EngineConfig,
    delivery::DeliveryTransport,
    error::{DeliveryErrorKind, PipelineError, Result},
    event::{Category, EventOp, Priority},
    store::{AuditStore, DeadLetterStore, DispatchStore, Storage, SubscriberStore},
    subscriber::Subscriber,
    template::TemplateRenderer,
};

/// Status of one dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    /// Waiting for a dispatcher pass
    Pending,
    /// Claimed by a dispatcher
    Processing,
    /// Delivered (terminal)
    Sent,
    /// Failed, awaiting its retry time
    Failed,
    /// Retry budget exhausted (terminal)
    Dead,
}

impl DispatchStatus {
    /// Stable string form used in persisted rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Processing => "processing",
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Dead => "dead",
        }
    }

    /// Terminal states are never picked up again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, DispatchStatus::Sent | DispatchStatus::Dead)
    }
}

impl std::str::FromStr for DispatchStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DispatchStatus::Pending),
            "processing" => Ok(DispatchStatus::Processing),
            "sent" => Ok(DispatchStatus::Sent),
            "failed" => Ok(DispatchStatus::Failed),
            "dead" => Ok(DispatchStatus::Dead),
            other => Err(PipelineError::SerializationError(format!(
                "unknown dispatch status '{other}'"
            ))),
        }
    }
}

/// The last recorded failure on a dispatch record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchFailure {
    /// Classified failure kind
    pub kind:    DeliveryErrorKind,
    /// HTTP status code, when the endpoint answered
    pub code:    Option<u16>,
    /// Error message
    pub message: String,
}

impl DispatchFailure {
    /// Extract the failure facts from a delivery error.
    #[must_use]
    pub fn from_error(err: &PipelineError) -> Self {
        match err {
            PipelineError::DeliveryFailed { kind, code, message } => Self {
                kind:    *kind,
                code:    *code,
                message: message.clone(),
            },
            other => Self {
                kind:    DeliveryErrorKind::Other,
                code:    None,
                message: other.to_string(),
            },
        }
    }
}

/// A new dispatch to enqueue.
#[derive(Debug, Clone)]
pub struct NewDispatch {
    /// The pull-log row this delivery mirrors, if one was appended
    pub event_log_id:   Option<i64>,
    /// Technical model name
    pub model:          String,
    /// Record id
    pub record_id:      i64,
    /// The operation
    pub op:             EventOp,
    /// Target subscriber
    pub subscriber_id:  i64,
    /// Event payload
    pub payload:        Value,
    /// Changed field names (write operations)
    pub changed_fields: Vec<String>,
    /// Priority
    pub priority:       Priority,
    /// Category
    pub category:       Category,
    /// Retry budget
    pub max_retries:    u32,
    /// Optional payload template (copied from the rule at enqueue time)
    pub template:       Option<String>,
}

/// One per-subscriber delivery record.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    /// Dispatch id (assigned by storage)
    pub id:             i64,
    /// The pull-log row this delivery mirrors, if any
    pub event_log_id:   Option<i64>,
    /// Technical model name
    pub model:          String,
    /// Record id
    pub record_id:      i64,
    /// The operation
    pub op:             EventOp,
    /// Target subscriber
    pub subscriber_id:  i64,
    /// Event payload
    pub payload:        Value,
    /// Changed field names (write operations)
    pub changed_fields: Vec<String>,
    /// Priority
    pub priority:       Priority,
    /// Category
    pub category:       Category,
    /// Current status
    pub status:         DispatchStatus,
    /// Retries consumed so far
    pub retry_count:    u32,
    /// Retry budget
    pub max_retries:    u32,
    /// When the next attempt is due (failed rows) or the postpone time
    /// (pending rows)
    pub next_retry_at:  Option<DateTime<Utc>>,
    /// Last recorded failure
    pub last_error:     Option<DispatchFailure>,
    /// When the dispatch was enqueued
    pub timestamp:      DateTime<Utc>,
    /// When the current processing attempt started
    pub started_at:     Option<DateTime<Utc>>,
    /// When delivery succeeded
    pub sent_at:        Option<DateTime<Utc>>,
    /// HTTP response code of the successful delivery
    pub response_code:  Option<u16>,
    /// Delivery wall-clock time in milliseconds
    pub processing_ms:  Option<f64>,
    /// Optional payload template
    pub template:       Option<String>,
}

/// Operator resolution of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Awaiting operator action
    Pending,
    /// Operator requeued the dispatch
    Retrying,
    /// Resolved
    Resolved,
    /// Deliberately ignored
    Ignored,
}

/// Post-mortem record for a dispatch that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Dead-letter id (assigned by storage)
    pub id:             i64,
    /// The dead dispatch
    pub dispatch_id:    i64,
    /// When the dispatch died
    pub failed_at:      DateTime<Utc>,
    /// Retries consumed before death
    pub retry_attempts: u32,
    /// The final error
    pub original_error: String,
    /// Operator resolution state
    pub resolution:     Resolution,
    /// Operator who resolved it
    pub resolver:       Option<i64>,
    /// When it was resolved
    pub resolved_at:    Option<DateTime<Utc>>,
    /// Operator notes
    pub notes:          Option<String>,
}

impl DeadLetter {
    /// A fresh pending dead letter for a dispatch.
    #[must_use]
    pub fn new(dispatch_id: i64, retry_attempts: u32, original_error: impl Into<String>) -> Self {
        Self {
            id: 0,
            dispatch_id,
            failed_at: Utc::now(),
            retry_attempts,
            original_error: original_error.into(),
            resolution: Resolution::Pending,
            resolver: None,
            resolved_at: None,
            notes: None,
        }
    }
}

/// Outcome of one dispatcher pass over one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessOutcome {
    Sent,
    Retried,
    Dead,
    Postponed,
    Skipped,
}

/// Tally of one dispatcher pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Records selected as due
    pub selected:  usize,
    /// Delivered
    pub sent:      usize,
    /// Scheduled for retry
    pub retried:   usize,
    /// Promoted to dead letters
    pub dead:      usize,
    /// Postponed by rate limiting
    pub postponed: usize,
    /// Skipped (claim races, missing subscribers)
    pub skipped:   usize,
}

/// Drives dispatch records through delivery, retry, and dead-lettering.
pub struct Dispatcher {
    storage:    Arc<dyn Storage>,
    transport:  Arc<dyn DeliveryTransport>,
    renderer:   Arc<dyn TemplateRenderer>,
    config:     EngineConfig,
    worker_id:  String,
    /// Subscribers already warned about disabled TLS verification
    /// (once per process lifetime).
    tls_warned: DashMap<i64, ()>,
}

impl Dispatcher {
    /// Create a dispatcher over the given storage and transport.
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn DeliveryTransport>,
        renderer: Arc<dyn TemplateRenderer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            renderer,
            config,
            worker_id: format!("dispatcher-{}", uuid::Uuid::new_v4()),
            tls_warned: DashMap::new(),
        }
    }

    /// This dispatcher's identity, for log correlation.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One pass: select due records and process them with bounded
    /// concurrency. Errors on individual records are logged, never fatal.
    pub async fn run_once(&self) -> Result<DispatchSummary> {
        let now = Utc::now();
        let due = self.storage.select_due(now, self.config.dispatch_batch_size).await?;

        let mut summary = DispatchSummary {
            selected: due.len(),
            ..DispatchSummary::default()
        };

        if due.is_empty() {
            return Ok(summary);
        }

        debug!(worker = %self.worker_id, count = due.len(), "dispatching due records");

        let outcomes: Vec<ProcessOutcome> = futures::stream::iter(due)
            .map(|record| async move {
                let id = record.id;
                match self.process(record).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(dispatch_id = id, error = %e, "dispatch processing error");
                        ProcessOutcome::Skipped
                    },
                }
            })
            .buffer_unordered(self.config.dispatcher_pool_size.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                ProcessOutcome::Sent => summary.sent += 1,
                ProcessOutcome::Retried => summary.retried += 1,
                ProcessOutcome::Dead => summary.dead += 1,
                ProcessOutcome::Postponed => summary.postponed += 1,
                ProcessOutcome::Skipped => summary.skipped += 1,
            }
        }

        info!(
            selected = summary.selected,
            sent = summary.sent,
            retried = summary.retried,
            dead = summary.dead,
            postponed = summary.postponed,
            "dispatch pass complete"
        );

        Ok(summary)
    }

    /// Process one dispatch by id (the instant-send path).
    pub async fn process_by_id(&self, id: i64) -> Result<()> {
        let Some(record) = self.storage.get_dispatch(id).await? else {
            return Err(PipelineError::StorageError {
                reason: format!("dispatch {id} not found"),
            });
        };
        self.process(record).await.map(|_| ())
    }

    async fn process(&self, record: DispatchRecord) -> Result<ProcessOutcome> {
        if record.status.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                dispatch_id: record.id,
                status:      record.status.as_str().to_string(),
            });
        }

        let Some(subscriber) = self.storage.get_subscriber(record.subscriber_id).await? else {
            // Subscriber was hard-deleted under us: nothing sane to do but
            // dead-letter the record so an operator notices.
            let failure = DispatchFailure {
                kind:    DeliveryErrorKind::Other,
                code:    None,
                message: format!("subscriber {} no longer exists", record.subscriber_id),
            };
            self.mark_as_dead(&record, record.retry_count, &failure).await?;
            return Ok(ProcessOutcome::Dead);
        };

        if !subscriber.enabled {
            debug!(dispatch_id = record.id, "subscriber disabled, leaving record queued");
            return Ok(ProcessOutcome::Skipped);
        }

        // Rate limit: checked before claiming so a postponed record never
        // leaves pending/failed.
        if subscriber.rate_limit > 0 {
            let cutoff =
                Utc::now() - ChronoDuration::seconds(subscriber.rate_window_secs.min(i64::MAX as u64) as i64);
            let sent = self.storage.sent_count_since(subscriber.id, cutoff).await?;
            if sent >= u64::from(subscriber.rate_limit) {
                let until =
                    Utc::now() + ChronoDuration::seconds(self.config.rate_postpone_secs as i64);
                self.storage.postpone_dispatch(record.id, until).await?;
                debug!(
                    dispatch_id = record.id,
                    subscriber = subscriber.id,
                    "rate limit reached, postponed"
                );
                return Ok(ProcessOutcome::Postponed);
            }
        }

        if !self.storage.claim_dispatch(record.id, Utc::now()).await? {
            // Another worker got there first.
            return Ok(ProcessOutcome::Skipped);
        }

        if !subscriber.verify_tls && self.tls_warned.insert(subscriber.id, ()).is_none() {
            warn!(subscriber = subscriber.id, "TLS verification disabled for subscriber");
            self.audit(
                AuditRecord::for_dispatch(record.id, AuditAction::StatusChanged)
                    .with_note(format!("TLS verification disabled for subscriber {}", subscriber.id)),
            )
            .await;
        }

        let payload = self.build_outbound(&record);
        let start = std::time::Instant::now();

        match self.transport.deliver(&subscriber, &payload).await {
            Ok(outcome) => {
                let now = Utc::now();
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.storage
                    .mark_sent(record.id, now, outcome.status_code, elapsed_ms)
                    .await?;
                self.storage.record_subscriber_outcome(subscriber.id, true, now).await?;
                self.audit(AuditRecord::for_dispatch(record.id, AuditAction::Sent)).await;
                debug!(
                    dispatch_id = record.id,
                    status = outcome.status_code,
                    elapsed_ms,
                    "dispatch delivered"
                );
                Ok(ProcessOutcome::Sent)
            },
            Err(err) => {
                self.storage
                    .record_subscriber_outcome(subscriber.id, false, Utc::now())
                    .await?;
                let failure = DispatchFailure::from_error(&err);
                self.schedule_retry(&record, &failure).await
            },
        }
    }

    /// Schedule the next retry or promote the record to the dead-letter
    /// queue when the budget is exhausted or the failure is not retryable.
    async fn schedule_retry(
        &self,
        record: &DispatchRecord,
        failure: &DispatchFailure,
    ) -> Result<ProcessOutcome> {
        let new_count = record.retry_count + 1;

        if !failure.kind.is_retryable(self.config.retry_client_errors) {
            warn!(
                dispatch_id = record.id,
                kind = failure.kind.as_str(),
                "failure not retryable, dead-lettering"
            );
            self.mark_as_dead(record, new_count, failure).await?;
            return Ok(ProcessOutcome::Dead);
        }

        if new_count >= record.max_retries {
            self.mark_as_dead(record, new_count, failure).await?;
            return Ok(ProcessOutcome::Dead);
        }

        let delay = self.backoff_delay(new_count);
        let next_retry_at = Utc::now() + delay;
        self.storage
            .record_dispatch_failure(record.id, new_count, next_retry_at, failure)
            .await?;
        self.audit(
            AuditRecord::for_dispatch(record.id, AuditAction::Retried)
                .with_transition(DispatchStatus::Processing.as_str(), DispatchStatus::Failed.as_str())
                .with_note(format!("retry {new_count} at {next_retry_at}")),
        )
        .await;
        info!(
            dispatch_id = record.id,
            retry = new_count,
            next_retry_at = %next_retry_at,
            "dispatch scheduled for retry"
        );
        Ok(ProcessOutcome::Retried)
    }

    async fn mark_as_dead(
        &self,
        record: &DispatchRecord,
        retry_count: u32,
        failure: &DispatchFailure,
    ) -> Result<()> {
        // Clamp so the retry-count-within-budget invariant survives even
        // a zero-budget record dying on its first attempt.
        let retry_count = retry_count.min(record.max_retries);
        self.storage.mark_dead(record.id, retry_count, failure).await?;
        self.storage
            .create_dead_letter(DeadLetter::new(record.id, retry_count, failure.message.clone()))
            .await?;
        self.audit(
            AuditRecord::for_dispatch(record.id, AuditAction::Failed)
                .with_note(format!("dead after {retry_count} retries: {}", failure.message)),
        )
        .await;
        warn!(
            dispatch_id = record.id,
            retries = retry_count,
            "dispatch moved to dead letter queue"
        );
        Ok(())
    }

    /// Exponential backoff: `base_delay * 2^(retry_count - 1)`.
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> ChronoDuration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let secs = self.config.retry_base_delay_secs.saturating_mul(1_u64 << exponent);
        ChronoDuration::seconds(secs.min(i64::MAX as u64) as i64)
    }

    /// Assemble the outbound subscriber payload, applying the record's
    /// template when present (falling back on render failure).
    fn build_outbound(&self, record: &DispatchRecord) -> Value {
        let mut payload = json!({
            "event_id": record.id,
            "model": record.model,
            "record_id": record.record_id,
            "event": record.op.as_str(),
            "timestamp": record.timestamp.to_rfc3339(),
            "priority": record.priority.as_str(),
            "category": record.category.as_str(),
            "data": record.payload,
        });

        if record.op == EventOp::Write && !record.changed_fields.is_empty() {
            payload["changed_fields"] = json!(record.changed_fields);
        }

        let Some(template) = record.template.as_deref() else {
            return payload;
        };

        match self.renderer.render(template, &payload) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(dispatch_id = record.id, error = %e, "outbound template failed, sending untemplated");
                payload
            },
        }
    }

    async fn audit(&self, record: AuditRecord) {
        if let Err(e) = self.storage.record_audit(record).await {
            // The audit trail is best-effort; a failed line must not block
            // the dispatch itself.
            error!(error = %e, "failed to record audit line");
        }
    }
}
