//! Append-only audit trail for dispatch lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Dispatch record enqueued
    Created,
    /// Delivery succeeded
    Sent,
    /// Delivery failed terminally (dead letter)
    Failed,
    /// Retry scheduled after a failed attempt
    Retried,
    /// Record archived by maintenance
    Archived,
    /// Record deleted by maintenance
    Deleted,
    /// Any other status transition worth recording
    StatusChanged,
}

impl AuditAction {
    /// Stable string form used in persisted rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Sent => "sent",
            AuditAction::Failed => "failed",
            AuditAction::Retried => "retried",
            AuditAction::Archived => "archived",
            AuditAction::Deleted => "deleted",
            AuditAction::StatusChanged => "status_changed",
        }
    }
}

/// One immutable history line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Audit row id (assigned by storage)
    pub id:          i64,
    /// The dispatch this line belongs to, when applicable
    pub dispatch_id: Option<i64>,
    /// What happened
    pub action:      AuditAction,
    /// When it happened
    pub timestamp:   DateTime<Utc>,
    /// Acting user, if any
    pub user_id:     Option<i64>,
    /// State before the transition
    pub old:         Option<serde_json::Value>,
    /// State after the transition
    pub new:         Option<serde_json::Value>,
    /// Free-text note
    pub note:        Option<String>,
}

impl AuditRecord {
    /// A new audit line for a dispatch, timestamped now.
    #[must_use]
    pub fn for_dispatch(dispatch_id: i64, action: AuditAction) -> Self {
        Self {
            id: 0,
            dispatch_id: Some(dispatch_id),
            action,
            timestamp: Utc::now(),
            user_id: None,
            old: None,
            new: None,
            note: None,
        }
    }

    /// Attach a free-text note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Attach before/after status strings.
    #[must_use]
    pub fn with_transition(mut self, old: &str, new: &str) -> Self {
        self.old = Some(serde_json::Value::String(old.to_string()));
        self.new = Some(serde_json::Value::String(new.to_string()));
        self
    }
}
