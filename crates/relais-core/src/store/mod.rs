//! Storage trait boundary and backends.
//!
//! Every persistent concern sits behind a focused trait so the pipeline can
//! run against PostgreSQL in production and against the in-memory backend in
//! tests and embedded deployments. [`Storage`] bundles them for components
//! that need several concerns.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    audit::AuditRecord,
    dispatch::{DeadLetter, DispatchFailure, DispatchRecord, NewDispatch, Resolution},
    error::Result,
    event::{AppendOutcome, LogStats, NewEvent, PullBatch, PullQuery},
    rules::TrackingRule,
    subscriber::Subscriber,
    sync::SyncState,
};

/// Tracking-rule persistence.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert a rule, assigning its id.
    async fn insert_rule(&self, rule: TrackingRule) -> Result<TrackingRule>;

    /// Update an existing rule by id.
    async fn update_rule(&self, rule: &TrackingRule) -> Result<()>;

    /// Delete a rule by id.
    async fn delete_rule(&self, id: i64) -> Result<()>;

    /// Fetch one rule by id.
    async fn get_rule(&self, id: i64) -> Result<Option<TrackingRule>>;

    /// All active rules (the registry rebuilds its cache from this).
    async fn active_rules(&self) -> Result<Vec<TrackingRule>>;

    /// Record when a rule last fired.
    async fn touch_rule_trigger(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
}

/// Subscriber persistence.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Insert a subscriber, assigning its id.
    async fn insert_subscriber(&self, subscriber: Subscriber) -> Result<Subscriber>;

    /// Update an existing subscriber by id.
    async fn update_subscriber(&self, subscriber: &Subscriber) -> Result<()>;

    /// Fetch one subscriber by id.
    async fn get_subscriber(&self, id: i64) -> Result<Option<Subscriber>>;

    /// Fetch several subscribers by id, preserving only those that exist.
    async fn get_subscribers(&self, ids: &[i64]) -> Result<Vec<Subscriber>>;

    /// Record a delivery outcome timestamp on the subscriber.
    async fn record_subscriber_outcome(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// The append-only pull log.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Append an event, applying supersession for its `(model, record_id)`
    /// pair inside one serialized transaction:
    /// a `create` purges prior `write` rows; a `write` is absorbed when an
    /// unarchived `create` already exists; `unlink` always appends.
    ///
    /// Rejects `record_id == 0` (negative ids mark synthetic events).
    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome>;

    /// Cursor-based pull of unprocessed, unarchived events ordered by id.
    async fn pull_events(&self, query: &PullQuery) -> Result<PullBatch>;

    /// Acknowledge events by id. Idempotent; unknown ids are ignored.
    /// Returns the number of rows that exist among `ids`.
    async fn mark_processed(&self, ids: &[i64]) -> Result<u64>;

    /// Number of unprocessed, unarchived events.
    async fn pending_events(&self) -> Result<u64>;

    /// Archive processed events older than `cutoff`. Idempotent.
    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete archived events older than `cutoff`. Idempotent.
    async fn delete_archived_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Aggregate statistics for events newer than `since`.
    async fn log_stats(&self, since: DateTime<Utc>, period_days: u32) -> Result<LogStats>;

    /// Distinct `(model, record_id)` pairs present in the log, for the
    /// orphan sweep. Synthetic (negative) record ids are excluded.
    async fn live_record_refs(&self) -> Result<Vec<(String, i64)>>;

    /// Drop all log rows for one `(model, record_id)` pair.
    async fn delete_events_for_record(&self, model: &str, record_id: i64) -> Result<u64>;
}

/// The push dispatch queue.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Enqueue a pending dispatch record, assigning its id.
    async fn enqueue_dispatch(&self, dispatch: NewDispatch) -> Result<DispatchRecord>;

    /// Fetch one dispatch record.
    async fn get_dispatch(&self, id: i64) -> Result<Option<DispatchRecord>>;

    /// Up to `limit` records due for work, ordered by
    /// `(priority DESC, timestamp ASC)`: pending rows whose postpone time
    /// (if any) has passed, plus failed rows due for retry with budget left.
    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchRecord>>;

    /// Atomically claim a record for processing (CAS `pending|failed` →
    /// `processing`, stamping `started_at`). Returns false when the record
    /// was concurrently claimed or finished.
    async fn claim_dispatch(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Terminal success: `processing` → `sent`.
    async fn mark_sent(
        &self,
        id: i64,
        at: DateTime<Utc>,
        response_code: u16,
        processing_ms: f64,
    ) -> Result<()>;

    /// Failed attempt with retry budget left: → `failed` with the new retry
    /// count and due time.
    async fn record_dispatch_failure(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        failure: &DispatchFailure,
    ) -> Result<()>;

    /// Terminal failure: → `dead` with the final retry count.
    async fn mark_dead(&self, id: i64, retry_count: u32, failure: &DispatchFailure) -> Result<()>;

    /// Push a record's due time back without changing its status
    /// (rate-limit postponement).
    async fn postpone_dispatch(&self, id: i64, until: DateTime<Utc>) -> Result<()>;

    /// Return `processing` records started before `cutoff` to `pending`
    /// (crash recovery). Returns the number reclaimed.
    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Successful deliveries to a subscriber since `cutoff`
    /// (rate-limit accounting).
    async fn sent_count_since(&self, subscriber_id: i64, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Dead-letter persistence.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Create the dead letter for a dispatch. At most one per dispatch:
    /// a second call for the same dispatch returns the existing row.
    async fn create_dead_letter(&self, letter: DeadLetter) -> Result<DeadLetter>;

    /// Dead letters awaiting operator action.
    async fn pending_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Record an operator resolution.
    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolution: Resolution,
        resolver: Option<i64>,
        notes: Option<String>,
    ) -> Result<()>;
}

/// Pull-cursor persistence.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Fetch the cursor for `(user_id, device_id)`, creating it on first
    /// sync. Updates the stored `app_type` when it changed.
    async fn get_or_create_sync_state(
        &self,
        user_id: i64,
        device_id: &str,
        app_type: &str,
    ) -> Result<SyncState>;

    /// Persist an advanced cursor after an acknowledgement.
    async fn update_sync_state(&self, state: &SyncState) -> Result<()>;

    /// Delete inactive cursors untouched since `cutoff`.
    async fn cleanup_sync_states(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Audit-trail persistence.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one audit line.
    async fn record_audit(&self, record: AuditRecord) -> Result<()>;

    /// Audit lines for one dispatch, oldest first.
    async fn audit_for_dispatch(&self, dispatch_id: i64) -> Result<Vec<AuditRecord>>;

    /// Delete audit lines older than `cutoff`.
    async fn cleanup_audit(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// A failure captured on the write path instead of being raised into the
/// host (the no-silent-loss invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error row id (assigned by storage)
    pub id:        i64,
    /// Model involved
    pub model:     String,
    /// Record involved
    pub record_id: i64,
    /// What went wrong
    pub message:   String,
    /// When it was captured
    pub timestamp: DateTime<Utc>,
}

/// Error-sink persistence.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// Capture a write-path failure.
    async fn record_error(&self, model: &str, record_id: i64, message: &str) -> Result<()>;

    /// Most recent captured failures, newest first.
    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>>;
}

/// Everything the engine needs from one storage backend.
pub trait Storage:
    RuleStore
    + SubscriberStore
    + EventLogStore
    + DispatchStore
    + DeadLetterStore
    + SyncStateStore
    + AuditStore
    + ErrorSink
{
}

impl<T> Storage for T where
    T: RuleStore
        + SubscriberStore
        + EventLogStore
        + DispatchStore
        + DeadLetterStore
        + SyncStateStore
        + AuditStore
        + ErrorSink
{
}
