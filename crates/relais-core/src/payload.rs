//! Payload construction from entity snapshots.
//!
//! The builder reads a record through the entity-access capability and
//! produces a JSON-safe object honoring the field policy: tracked-field
//! restriction, per-kind serialization, a `_metadata` block, and
//! `_changed_fields` for writes. When the rule carries a template, the
//! builder delegates to the renderer and falls back to the untemplated
//! payload on failure.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::{
    entity::{EntityRecord, FieldKind, TypedValue},
    event::EventOp,
    rules::TrackingRule,
    template::{PlaceholderRenderer, TemplateRenderer},
};

/// Cap on serialized many-reference entries per field.
const MANY_REF_CAP: usize = 50;

/// Builds JSON payloads from entity snapshots.
pub struct PayloadBuilder {
    renderer: Arc<dyn TemplateRenderer>,
}

impl PayloadBuilder {
    /// Builder with the default placeholder renderer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            renderer: Arc::new(PlaceholderRenderer::new()),
        }
    }

    /// Builder with a custom template renderer.
    #[must_use]
    pub fn with_renderer(renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self { renderer }
    }

    /// Build the payload for one record under an optional rule.
    ///
    /// Never fails: field read problems null the field, template failures
    /// fall back to the untemplated payload. Both are logged.
    #[must_use]
    pub fn build(
        &self,
        record: &dyn EntityRecord,
        rule: Option<&TrackingRule>,
        op: EventOp,
        changed_fields: Option<&[String]>,
    ) -> Value {
        let data = self.assemble(record, rule, op, changed_fields);

        let Some(template) = rule.and_then(|r| r.template.as_deref()) else {
            return data;
        };

        match self.renderer.render(template, &data) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(
                    model = record.model(),
                    record_id = record.id(),
                    error = %e,
                    "template rendering failed, using untemplated payload"
                );
                data
            },
        }
    }

    fn assemble(
        &self,
        record: &dyn EntityRecord,
        rule: Option<&TrackingRule>,
        op: EventOp,
        changed_fields: Option<&[String]>,
    ) -> Value {
        let descriptors = record.fields();

        let tracked: Option<&[String]> = rule
            .map(|r| r.tracked_fields.as_slice())
            .filter(|fields| !fields.is_empty());

        let mut data = Map::new();

        for descriptor in &descriptors {
            if let Some(tracked) = tracked {
                if !tracked.iter().any(|f| f == &descriptor.name) {
                    continue;
                }
            } else if descriptor.name.starts_with('_') {
                // Internal fields are excluded from "all fields" payloads.
                continue;
            }

            // Computed non-stored fields would force recomputation; skip.
            if descriptor.computed && !descriptor.stored {
                continue;
            }

            let value = record.value(&descriptor.name);

            let json_value = match (descriptor.kind, value) {
                // Binary content is never embedded, only its presence.
                (FieldKind::Binary, Some(TypedValue::Blob { present })) => json!(present),
                (FieldKind::Binary, Some(other)) => json!(!matches!(other, TypedValue::Null)),
                (FieldKind::Binary, None) => json!(false),
                (_, Some(v)) => v.to_json(MANY_REF_CAP),
                (_, None) => Value::Null,
            };

            data.insert(descriptor.name.clone(), json_value);
        }

        let mut metadata = Map::new();
        metadata.insert("model".to_string(), json!(record.model()));
        metadata.insert("id".to_string(), json!(record.id()));
        metadata.insert("display_name".to_string(), json!(record.display_name()));
        metadata.insert("operation".to_string(), json!(op.as_str()));
        metadata.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        if let Some(rule) = rule {
            metadata.insert("rule_id".to_string(), json!(rule.id));
        }
        data.insert("_metadata".to_string(), Value::Object(metadata));

        if let Some(changed) = changed_fields {
            if op == EventOp::Write {
                data.insert("_changed_fields".to_string(), json!(changed));
            }
        }

        Value::Object(data)
    }
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::RefValue,
        event::{Category, Priority},
        testing::MapRecord,
    };

    fn sample_rule(tracked: &[&str], template: Option<&str>) -> TrackingRule {
        TrackingRule {
            id:             5,
            name:           "orders".to_string(),
            sequence:       10,
            active:         true,
            model:          "sale.order".to_string(),
            operation:      EventOp::Write,
            filter:         None,
            tracked_fields: tracked.iter().map(ToString::to_string).collect(),
            subscribers:    vec![],
            template:       template.map(ToString::to_string),
            priority:       Priority::Medium,
            category:       Category::Business,
            instant_send:   false,
            rate_limit:     0,
            debounce_secs:  0,
            test_mode:      false,
            last_trigger:   None,
            description:    None,
        }
    }

    fn sample_record() -> MapRecord {
        MapRecord::new("sale.order", 42)
            .with_display_name("SO0042")
            .with_str("state", "sale")
            .with_float("total", 250.5)
            .with_one_ref(
                "partner_id",
                Some(RefValue {
                    id:   7,
                    name: "Azure Interior".to_string(),
                }),
            )
            .with_blob("signature", true)
            .with_computed("margin_pct")
            .with_str("_internal_note", "hidden")
    }

    #[test]
    fn test_all_fields_payload_shape() {
        let builder = PayloadBuilder::new();
        let payload = builder.build(&sample_record(), None, EventOp::Create, None);

        assert_eq!(payload["state"], json!("sale"));
        assert_eq!(payload["total"], json!(250.5));
        assert_eq!(payload["partner_id"], json!({"id": 7, "name": "Azure Interior"}));
        // Blob is a presence flag, computed non-stored and internals are gone.
        assert_eq!(payload["signature"], json!(true));
        assert!(payload.get("margin_pct").is_none());
        assert!(payload.get("_internal_note").is_none());

        let meta = &payload["_metadata"];
        assert_eq!(meta["model"], json!("sale.order"));
        assert_eq!(meta["id"], json!(42));
        assert_eq!(meta["display_name"], json!("SO0042"));
        assert_eq!(meta["operation"], json!("create"));
        assert!(meta["timestamp"].is_string());
    }

    #[test]
    fn test_tracked_fields_restrict_payload() {
        let builder = PayloadBuilder::new();
        let rule = sample_rule(&["state"], None);
        let payload = builder.build(&sample_record(), Some(&rule), EventOp::Write, None);

        assert_eq!(payload["state"], json!("sale"));
        assert!(payload.get("total").is_none());
        assert_eq!(payload["_metadata"]["rule_id"], json!(5));
    }

    #[test]
    fn test_changed_fields_only_on_write() {
        let builder = PayloadBuilder::new();
        let changed = vec!["state".to_string()];

        let write = builder.build(&sample_record(), None, EventOp::Write, Some(&changed));
        assert_eq!(write["_changed_fields"], json!(["state"]));

        let create = builder.build(&sample_record(), None, EventOp::Create, Some(&changed));
        assert!(create.get("_changed_fields").is_none());
    }

    #[test]
    fn test_template_applied() {
        let builder = PayloadBuilder::new();
        let rule = sample_rule(&[], Some(r#"{"status": "{{ state }}"}"#));
        let payload = builder.build(&sample_record(), Some(&rule), EventOp::Write, None);

        assert_eq!(payload, json!({"status": "sale"}));
    }

    #[test]
    fn test_template_failure_falls_back() {
        let builder = PayloadBuilder::new();
        let rule = sample_rule(&[], Some("{broken template"));
        let payload = builder.build(&sample_record(), Some(&rule), EventOp::Write, None);

        // Untemplated payload survives a broken template.
        assert_eq!(payload["state"], json!("sale"));
        assert!(payload["_metadata"].is_object());
    }
}
