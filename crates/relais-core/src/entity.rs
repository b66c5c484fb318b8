//! Entity-access capability: how the pipeline reads host records.
//!
//! The host application owns its ORM; the pipeline never touches it
//! directly. Instead the host hands over record snapshots implementing
//! [`EntityRecord`] and (optionally) an [`EntityCatalog`] for field
//! validation and existence probes. For deletes the host must capture
//! snapshots *before* the unlink runs, since the live record is gone by
//! the time the hook fires.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The kind of a host entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Character/text field
    Char,
    /// Integer field
    Integer,
    /// Float field
    Float,
    /// Boolean field
    Boolean,
    /// Date (no time component)
    Date,
    /// Date and time
    DateTime,
    /// Reference to a single other record
    OneRef,
    /// Reference to many other records
    ManyRef,
    /// Binary blob; payloads only carry a presence flag
    Binary,
}

/// Description of one host entity field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name
    pub name:     String,
    /// Field kind
    pub kind:     FieldKind,
    /// Whether the field is persisted
    pub stored:   bool,
    /// Whether the field is computed
    pub computed: bool,
}

impl FieldDescriptor {
    /// Plain stored field of the given kind.
    #[must_use]
    pub fn stored(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            stored: true,
            computed: false,
        }
    }

    /// Computed, non-stored field (skipped by the payload builder).
    #[must_use]
    pub fn computed(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            stored: false,
            computed: true,
        }
    }
}

/// A `{id, name}` reference value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefValue {
    /// Referenced record id
    pub id:   i64,
    /// Referenced record display name
    pub name: String,
}

/// A typed field value read from a host record.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    /// Absent/unset value
    Null,
    /// Text value
    Str(String),
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// Boolean value
    Bool(bool),
    /// Date value
    Date(NaiveDate),
    /// Datetime value
    DateTime(DateTime<Utc>),
    /// Single reference, `None` when unset
    OneRef(Option<RefValue>),
    /// Many references
    ManyRef(Vec<RefValue>),
    /// Binary content presence flag
    Blob {
        /// Whether the blob is set
        present: bool,
    },
}

impl TypedValue {
    /// JSON representation per the payload field-type rules.
    ///
    /// Dates serialize as ISO-8601 strings, single references as
    /// `{id, name}` or null, many references as an array of `{id, name}`
    /// (the caller caps the length), blobs as a presence boolean.
    #[must_use]
    pub fn to_json(&self, many_ref_cap: usize) -> Value {
        match self {
            TypedValue::Null => Value::Null,
            TypedValue::Str(s) => json!(s),
            TypedValue::Int(i) => json!(i),
            TypedValue::Float(f) => json!(f),
            TypedValue::Bool(b) => json!(b),
            TypedValue::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            TypedValue::DateTime(dt) => json!(dt.to_rfc3339()),
            TypedValue::OneRef(Some(r)) => json!({"id": r.id, "name": r.name}),
            TypedValue::OneRef(None) => Value::Null,
            TypedValue::ManyRef(refs) => Value::Array(
                refs.iter()
                    .take(many_ref_cap)
                    .map(|r| json!({"id": r.id, "name": r.name}))
                    .collect(),
            ),
            TypedValue::Blob { present } => json!(present),
        }
    }
}

/// A snapshot of one host record, readable by name.
///
/// Implementations are provided by the host (or by
/// [`crate::testing::MapRecord`] in tests).
pub trait EntityRecord: Send + Sync {
    /// Technical model name (e.g., "sale.order").
    fn model(&self) -> &str;

    /// Record id. Negative ids mark synthetic records.
    fn id(&self) -> i64;

    /// Human-readable display name.
    fn display_name(&self) -> String;

    /// Descriptors for every readable field.
    fn fields(&self) -> Vec<FieldDescriptor>;

    /// Read one field by name. `None` when the field does not exist.
    fn value(&self, field: &str) -> Option<TypedValue>;
}

/// Model-level capability: field catalogs and existence probes.
///
/// Optional; when absent, tracked-field validation is skipped at rule save
/// time and the orphan sweep is disabled.
pub trait EntityCatalog: Send + Sync {
    /// Field descriptors for a model, `None` when the model is unknown.
    fn fields(&self, model: &str) -> Option<Vec<FieldDescriptor>>;

    /// Whether the record still exists in the host.
    fn exists(&self, model: &str, record_id: i64) -> bool;
}

/// Context flags the host passes into the interception hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookContext {
    /// Suppress all webhook processing for this invocation (batch imports,
    /// migrations, ...).
    pub webhook_disabled: bool,
    /// Acting user, recorded on appended events.
    pub user_id:          Option<i64>,
}

impl HookContext {
    /// Context with webhook processing enabled and no acting user.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            webhook_disabled: false,
            user_id:          None,
        }
    }

    /// Attribute events to the given user.
    #[must_use]
    pub const fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Suppress webhook processing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            webhook_disabled: true,
            user_id:          None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_values_are_iso8601() {
        let date = TypedValue::Date(NaiveDate::from_ymd_opt(2026, 3, 5).expect("valid date"));
        assert_eq!(date.to_json(50), json!("2026-03-05"));

        let dt = TypedValue::DateTime(
            DateTime::parse_from_rfc3339("2026-03-05T10:30:00Z")
                .expect("valid datetime")
                .with_timezone(&Utc),
        );
        assert_eq!(dt.to_json(50), json!("2026-03-05T10:30:00+00:00"));
    }

    #[test]
    fn test_one_ref_null_when_unset() {
        assert_eq!(TypedValue::OneRef(None).to_json(50), Value::Null);
        let set = TypedValue::OneRef(Some(RefValue {
            id:   9,
            name: "Azure Interior".to_string(),
        }));
        assert_eq!(set.to_json(50), json!({"id": 9, "name": "Azure Interior"}));
    }

    #[test]
    fn test_many_ref_capped() {
        let refs: Vec<RefValue> = (0..80)
            .map(|i| RefValue {
                id:   i,
                name: format!("line-{i}"),
            })
            .collect();
        let value = TypedValue::ManyRef(refs).to_json(50);
        let arr = value.as_array().expect("array");
        assert_eq!(arr.len(), 50);
    }

    #[test]
    fn test_blob_presence_flag() {
        assert_eq!(TypedValue::Blob { present: true }.to_json(50), json!(true));
        assert_eq!(TypedValue::Blob { present: false }.to_json(50), json!(false));
    }

    #[test]
    fn test_hook_context_builders() {
        let ctx = HookContext::new().with_user(7);
        assert!(!ctx.webhook_disabled);
        assert_eq!(ctx.user_id, Some(7));
        assert!(HookContext::disabled().webhook_disabled);
    }
}
