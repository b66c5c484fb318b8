//! Event types and pull-log data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The host operation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    /// Record was created
    Create,
    /// Record was updated
    Write,
    /// Record was deleted
    Unlink,
}

impl EventOp {
    /// Convert to the stable string representation used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventOp::Create => "create",
            EventOp::Write => "write",
            EventOp::Unlink => "unlink",
        }
    }

    /// Debounce bucket for this operation.
    ///
    /// Create and write share one bucket per record (a write often follows
    /// its create within milliseconds); unlink gets its own.
    #[must_use]
    pub const fn debounce_bucket(self) -> &'static str {
        match self {
            EventOp::Create | EventOp::Write => "create_write",
            EventOp::Unlink => "unlink",
        }
    }
}

impl std::str::FromStr for EventOp {
    type Err = crate::error::PipelineError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "create" => Ok(EventOp::Create),
            "write" => Ok(EventOp::Write),
            "unlink" => Ok(EventOp::Unlink),
            other => Err(crate::error::PipelineError::SerializationError(format!(
                "unknown event operation '{other}'"
            ))),
        }
    }
}

/// Event priority for processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Processed first; eligible for instant send
    High,
    /// Default priority
    #[default]
    Medium,
    /// Processed last
    Low,
}

impl Priority {
    /// Numeric rank: higher rank is dispatched first.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = crate::error::PipelineError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(crate::error::PipelineError::SerializationError(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Event category for filtering and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Business-facing change (default)
    #[default]
    Business,
    /// System/internal change
    System,
    /// Notification-only event
    Notification,
    /// Anything else
    Custom,
}

impl Category {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Business => "business",
            Category::System => "system",
            Category::Notification => "notification",
            Category::Custom => "custom",
        }
    }
}

impl std::str::FromStr for Category {
    type Err = crate::error::PipelineError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "business" => Ok(Category::Business),
            "system" => Ok(Category::System),
            "notification" => Ok(Category::Notification),
            "custom" => Ok(Category::Custom),
            other => Err(crate::error::PipelineError::SerializationError(format!(
                "unknown category '{other}'"
            ))),
        }
    }
}

/// A new event to append to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    /// Technical model name (e.g., "sale.order")
    pub model:     String,
    /// Id of the record that changed; negative ids mark synthetic events
    pub record_id: i64,
    /// The operation
    pub op:        EventOp,
    /// Complete event payload
    pub payload:   serde_json::Value,
    /// Priority (from the matching rule)
    pub priority:  Priority,
    /// Category (from the matching rule)
    pub category:  Category,
    /// User who triggered the change, if known
    pub user_id:   Option<i64>,
    /// Rule that produced the event, if any
    pub rule_id:   Option<i64>,
}

impl NewEvent {
    /// Create a new event with default priority/category and no attribution.
    #[must_use]
    pub fn new(model: impl Into<String>, record_id: i64, op: EventOp, payload: serde_json::Value) -> Self {
        Self {
            model: model.into(),
            record_id,
            op,
            payload,
            priority: Priority::default(),
            category: Category::default(),
            user_id: None,
            rule_id: None,
        }
    }
}

/// One row of the append-only pull log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Monotonic id, strictly increasing with insertion order
    pub id:           i64,
    /// Technical model name
    pub model:        String,
    /// Id of the record that changed
    pub record_id:    i64,
    /// The operation
    pub op:           EventOp,
    /// Complete event payload
    pub payload:      serde_json::Value,
    /// Priority
    pub priority:     Priority,
    /// Category
    pub category:     Category,
    /// When the event occurred
    pub timestamp:    DateTime<Utc>,
    /// User who triggered the change, if known
    pub user_id:      Option<i64>,
    /// Rule that produced the event, if any
    pub rule_id:      Option<i64>,
    /// Whether a pull consumer has acknowledged this event
    pub is_processed: bool,
    /// When it was acknowledged
    pub processed_at: Option<DateTime<Utc>>,
    /// Whether the maintenance sweep has archived it
    pub is_archived:  bool,
    /// When it was archived
    pub archived_at:  Option<DateTime<Utc>>,
}

impl EventLogEntry {
    /// Negative record ids mark synthetic (test) events.
    #[must_use]
    pub const fn is_synthetic(&self) -> bool {
        self.record_id < 0
    }
}

/// Outcome of an event-log append with supersession applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was inserted with the given id; `superseded_writes` earlier
    /// write rows for the same record were deleted first.
    Appended {
        /// Assigned monotonic id
        id:                i64,
        /// Write rows purged by a superseding create
        superseded_writes: usize,
    },
    /// A `write` arrived while an unarchived `create` for the same record
    /// already holds the full state; nothing was inserted.
    AbsorbedByCreate,
}

impl AppendOutcome {
    /// The assigned id, when a row was inserted.
    #[must_use]
    pub const fn id(&self) -> Option<i64> {
        match self {
            AppendOutcome::Appended { id, .. } => Some(*id),
            AppendOutcome::AbsorbedByCreate => None,
        }
    }
}

/// Cursor-based pull query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullQuery {
    /// Return events with `id > last_event_id`
    pub last_event_id: i64,
    /// Batch size, capped at [`PullQuery::MAX_LIMIT`]
    pub limit:         usize,
    /// Optional model filter
    pub models:        Option<Vec<String>>,
    /// Optional priority filter
    pub priority:      Option<Priority>,
}

impl PullQuery {
    /// Hard cap on pull batch size.
    pub const MAX_LIMIT: usize = 1000;

    /// Build a query from a cursor, clamping the limit.
    #[must_use]
    pub fn new(last_event_id: i64, limit: usize) -> Self {
        Self {
            last_event_id,
            limit: limit.min(Self::MAX_LIMIT).max(1),
            models: None,
            priority: None,
        }
    }

    /// Restrict the pull to the given models.
    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = if models.is_empty() { None } else { Some(models) };
        self
    }

    /// Restrict the pull to one priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Result of a pull query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullBatch {
    /// Matching events, ordered by id ascending
    pub events:   Vec<EventLogEntry>,
    /// Max id in the batch, or the request cursor when the batch is empty
    pub last_id:  i64,
    /// Whether further matching rows exist past `last_id`
    pub has_more: bool,
    /// Number of events in this batch
    pub count:    usize,
}

/// Count of events per model, for the statistics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCount {
    /// Technical model name
    pub model: String,
    /// Number of events in the window
    pub count: u64,
}

/// Aggregate event-log statistics over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStats {
    /// Window length in days
    pub period_days: u32,
    /// Total events in the window
    pub total:       u64,
    /// Acknowledged events
    pub processed:   u64,
    /// Unacknowledged, unarchived events
    pub pending:     u64,
    /// Archived events
    pub archived:    u64,
    /// Top models by event count (at most 10)
    pub by_model:    Vec<ModelCount>,
    /// Event counts keyed by priority string
    pub by_priority: std::collections::BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_op_serde_forms() {
        assert_eq!(serde_json::to_string(&EventOp::Unlink).expect("serialize"), "\"unlink\"");
        let op: EventOp = serde_json::from_str("\"write\"").expect("deserialize");
        assert_eq!(op, EventOp::Write);
    }

    #[test]
    fn test_debounce_bucket_sharing() {
        assert_eq!(EventOp::Create.debounce_bucket(), EventOp::Write.debounce_bucket());
        assert_ne!(EventOp::Unlink.debounce_bucket(), EventOp::Create.debounce_bucket());
    }

    #[test]
    fn test_pull_query_limit_clamped() {
        assert_eq!(PullQuery::new(0, 5000).limit, PullQuery::MAX_LIMIT);
        assert_eq!(PullQuery::new(0, 0).limit, 1);
        assert_eq!(PullQuery::new(0, 250).limit, 250);
    }

    #[test]
    fn test_pull_query_empty_models_is_none() {
        let query = PullQuery::new(0, 10).with_models(vec![]);
        assert!(query.models.is_none());
    }

    #[test]
    fn test_append_outcome_id() {
        let appended = AppendOutcome::Appended {
            id:                7,
            superseded_writes: 2,
        };
        assert_eq!(appended.id(), Some(7));
        assert_eq!(AppendOutcome::AbsorbedByCreate.id(), None);
    }

    #[test]
    fn test_synthetic_marker() {
        let entry = EventLogEntry {
            id:           1,
            model:        "sale.order".to_string(),
            record_id:    -1,
            op:           EventOp::Create,
            payload:      json!({}),
            priority:     Priority::Medium,
            category:     Category::Business,
            timestamp:    Utc::now(),
            user_id:      None,
            rule_id:      None,
            is_processed: false,
            processed_at: None,
            is_archived:  false,
            archived_at:  None,
        };
        assert!(entry.is_synthetic());
    }
}
