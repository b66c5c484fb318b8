//! Mock implementations of the pipeline's trait seams for testing without
//! a host application or a network.

#[cfg(any(test, feature = "testing"))]
pub mod mocks {
    //! Map-backed entity records, a scripted delivery transport, and a
    //! static entity catalog.

    use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::Value;

    use crate::{
        delivery::{DeliveryOutcome, DeliveryTransport},
        entity::{
            EntityCatalog, EntityRecord, FieldDescriptor, FieldKind, RefValue, TypedValue,
        },
        error::{DeliveryErrorKind, PipelineError, Result},
        subscriber::Subscriber,
    };

    /// An [`EntityRecord`] backed by a field map, for tests.
    #[derive(Debug, Clone)]
    pub struct MapRecord {
        model:        String,
        id:           i64,
        display_name: String,
        fields:       Vec<FieldDescriptor>,
        values:       BTreeMap<String, TypedValue>,
    }

    impl MapRecord {
        /// An empty record of the given model and id.
        #[must_use]
        pub fn new(model: impl Into<String>, id: i64) -> Self {
            let model = model.into();
            Self {
                display_name: format!("{model}#{id}"),
                model,
                id,
                fields: Vec::new(),
                values: BTreeMap::new(),
            }
        }

        /// Override the display name.
        #[must_use]
        pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
            self.display_name = name.into();
            self
        }

        fn push(mut self, name: &str, kind: FieldKind, value: TypedValue) -> Self {
            self.fields.push(FieldDescriptor::stored(name, kind));
            self.values.insert(name.to_string(), value);
            self
        }

        /// Add a stored text field.
        #[must_use]
        pub fn with_str(self, name: &str, value: &str) -> Self {
            self.push(name, FieldKind::Char, TypedValue::Str(value.to_string()))
        }

        /// Add a stored integer field.
        #[must_use]
        pub fn with_int(self, name: &str, value: i64) -> Self {
            self.push(name, FieldKind::Integer, TypedValue::Int(value))
        }

        /// Add a stored float field.
        #[must_use]
        pub fn with_float(self, name: &str, value: f64) -> Self {
            self.push(name, FieldKind::Float, TypedValue::Float(value))
        }

        /// Add a stored boolean field.
        #[must_use]
        pub fn with_bool(self, name: &str, value: bool) -> Self {
            self.push(name, FieldKind::Boolean, TypedValue::Bool(value))
        }

        /// Add a stored date field.
        #[must_use]
        pub fn with_date(self, name: &str, value: NaiveDate) -> Self {
            self.push(name, FieldKind::Date, TypedValue::Date(value))
        }

        /// Add a single-reference field.
        #[must_use]
        pub fn with_one_ref(self, name: &str, value: Option<RefValue>) -> Self {
            self.push(name, FieldKind::OneRef, TypedValue::OneRef(value))
        }

        /// Add a many-reference field.
        #[must_use]
        pub fn with_many_ref(self, name: &str, value: Vec<RefValue>) -> Self {
            self.push(name, FieldKind::ManyRef, TypedValue::ManyRef(value))
        }

        /// Add a binary field carrying only a presence flag.
        #[must_use]
        pub fn with_blob(self, name: &str, present: bool) -> Self {
            self.push(name, FieldKind::Binary, TypedValue::Blob { present })
        }

        /// Add a computed, non-stored field (skipped by the payload
        /// builder).
        #[must_use]
        pub fn with_computed(mut self, name: &str) -> Self {
            self.fields.push(FieldDescriptor::computed(name, FieldKind::Float));
            self.values.insert(name.to_string(), TypedValue::Float(0.0));
            self
        }
    }

    impl EntityRecord for MapRecord {
        fn model(&self) -> &str {
            &self.model
        }

        fn id(&self) -> i64 {
            self.id
        }

        fn display_name(&self) -> String {
            self.display_name.clone()
        }

        fn fields(&self) -> Vec<FieldDescriptor> {
            self.fields.clone()
        }

        fn value(&self, field: &str) -> Option<TypedValue> {
            self.values.get(field).cloned()
        }
    }

    /// Scripted delivery transport recording every delivery.
    pub struct MockTransport {
        script:     Mutex<VecDeque<std::result::Result<u16, DeliveryErrorKind>>>,
        fallback:   std::result::Result<u16, DeliveryErrorKind>,
        deliveries: Mutex<Vec<(i64, Value)>>,
    }

    impl MockTransport {
        /// Always answers 200.
        #[must_use]
        pub fn succeeding() -> Self {
            Self {
                script:     Mutex::new(VecDeque::new()),
                fallback:   Ok(200),
                deliveries: Mutex::new(Vec::new()),
            }
        }

        /// Always answers the given error status.
        #[must_use]
        pub fn failing_with_status(status: u16) -> Self {
            let kind = if (400..500).contains(&status) {
                DeliveryErrorKind::Http4xx
            } else {
                DeliveryErrorKind::Http5xx
            };
            Self {
                script:     Mutex::new(VecDeque::new()),
                fallback:   Err(kind),
                deliveries: Mutex::new(Vec::new()),
            }
        }

        /// Always fails with the given kind (timeout, connection, ...).
        #[must_use]
        pub fn failing_with(kind: DeliveryErrorKind) -> Self {
            Self {
                script:     Mutex::new(VecDeque::new()),
                fallback:   Err(kind),
                deliveries: Mutex::new(Vec::new()),
            }
        }

        /// Play the scripted outcomes in order, then fall back to success.
        #[must_use]
        pub fn scripted(outcomes: Vec<std::result::Result<u16, DeliveryErrorKind>>) -> Self {
            Self {
                script:     Mutex::new(outcomes.into()),
                fallback:   Ok(200),
                deliveries: Mutex::new(Vec::new()),
            }
        }

        /// Payloads delivered so far, with their subscriber ids.
        #[must_use]
        pub fn deliveries(&self) -> Vec<(i64, Value)> {
            self.deliveries.lock().expect("deliveries lock").clone()
        }

        /// Number of delivery attempts observed.
        #[must_use]
        pub fn attempt_count(&self) -> usize {
            self.deliveries.lock().expect("deliveries lock").len()
        }
    }

    #[async_trait]
    impl DeliveryTransport for MockTransport {
        async fn deliver(
            &self,
            subscriber: &Subscriber,
            payload: &Value,
        ) -> Result<DeliveryOutcome> {
            self.deliveries
                .lock()
                .expect("deliveries lock")
                .push((subscriber.id, payload.clone()));

            let outcome = self
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(self.fallback);

            match outcome {
                Ok(status) => Ok(DeliveryOutcome {
                    status_code:  status,
                    body_summary: String::new(),
                    duration_ms:  1.0,
                }),
                Err(kind) => {
                    let code = match kind {
                        DeliveryErrorKind::Http4xx => Some(404),
                        DeliveryErrorKind::Http5xx => Some(500),
                        _ => None,
                    };
                    Err(PipelineError::DeliveryFailed {
                        kind,
                        code,
                        message: format!("scripted {kind} failure"),
                    })
                },
            }
        }
    }

    /// Static [`EntityCatalog`]: fixed field lists and a mutable set of
    /// existing records.
    #[derive(Debug, Default)]
    pub struct StaticCatalog {
        fields:   HashMap<String, Vec<FieldDescriptor>>,
        existing: Mutex<HashSet<(String, i64)>>,
    }

    impl StaticCatalog {
        /// An empty catalog.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a model's field list.
        #[must_use]
        pub fn with_model(mut self, model: &str, fields: Vec<FieldDescriptor>) -> Self {
            self.fields.insert(model.to_string(), fields);
            self
        }

        /// Mark a record as existing in the host.
        pub fn add_record(&self, model: &str, record_id: i64) {
            self.existing.lock().expect("existing lock").insert((model.to_string(), record_id));
        }

        /// Remove a record (it was deleted in the host).
        pub fn remove_record(&self, model: &str, record_id: i64) {
            self.existing.lock().expect("existing lock").remove(&(model.to_string(), record_id));
        }
    }

    impl EntityCatalog for StaticCatalog {
        fn fields(&self, model: &str) -> Option<Vec<FieldDescriptor>> {
            self.fields.get(model).cloned()
        }

        fn exists(&self, model: &str, record_id: i64) -> bool {
            self.existing
                .lock()
                .expect("existing lock")
                .contains(&(model.to_string(), record_id))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_map_record_reads() {
            let record = MapRecord::new("sale.order", 42).with_str("state", "sale");
            assert_eq!(record.model(), "sale.order");
            assert_eq!(record.id(), 42);
            assert_eq!(record.value("state"), Some(TypedValue::Str("sale".to_string())));
            assert_eq!(record.value("missing"), None);
        }

        #[tokio::test]
        async fn test_scripted_transport_plays_in_order() {
            let transport = MockTransport::scripted(vec![
                Err(DeliveryErrorKind::Http5xx),
                Ok(201),
            ]);
            let sub = Subscriber::new("s", "https://example.com");

            assert!(transport.deliver(&sub, &serde_json::json!({})).await.is_err());
            let outcome = transport.deliver(&sub, &serde_json::json!({})).await.expect("ok");
            assert_eq!(outcome.status_code, 201);
            // Script exhausted: fallback success.
            assert!(transport.deliver(&sub, &serde_json::json!({})).await.is_ok());
            assert_eq!(transport.attempt_count(), 3);
        }

        #[test]
        fn test_static_catalog_existence() {
            let catalog = StaticCatalog::new();
            catalog.add_record("sale.order", 1);
            assert!(catalog.exists("sale.order", 1));
            catalog.remove_record("sale.order", 1);
            assert!(!catalog.exists("sale.order", 1));
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use mocks::{MapRecord, MockTransport, StaticCatalog};
