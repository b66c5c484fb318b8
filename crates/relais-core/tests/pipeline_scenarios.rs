//! End-to-end pipeline scenarios: hook → event log → pull, and
//! dispatch → retry → dead letter.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use relais_core::{
    delivery::{DeliveryOutcome, DeliveryTransport},
    dispatch::DispatchStatus,
    entity::{EntityRecord, FieldDescriptor, FieldKind, HookContext, TypedValue},
    error::{DeliveryErrorKind, PipelineError, Result},
    event::{EventOp, NewEvent, PullQuery},
    maintenance,
    store::{DeadLetterStore, DispatchStore, ErrorSink},
    subscriber::Subscriber,
    Engine, EngineConfig, MemoryStorage, TrackingRule,
};

/// Minimal map-backed record for driving the hook.
struct Record {
    model:  String,
    id:     i64,
    values: BTreeMap<String, TypedValue>,
}

impl Record {
    fn order(id: i64, state: &str) -> Arc<dyn EntityRecord> {
        let mut values = BTreeMap::new();
        values.insert("state".to_string(), TypedValue::Str(state.to_string()));
        Arc::new(Self {
            model: "sale.order".to_string(),
            id,
            values,
        })
    }
}

impl EntityRecord for Record {
    fn model(&self) -> &str {
        &self.model
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn display_name(&self) -> String {
        format!("SO{:04}", self.id)
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        self.values
            .keys()
            .map(|name| FieldDescriptor::stored(name.clone(), FieldKind::Char))
            .collect()
    }

    fn value(&self, field: &str) -> Option<TypedValue> {
        self.values.get(field).cloned()
    }
}

/// Transport that always answers with one scripted status.
struct FixedTransport {
    status:    u16,
    delivered: Mutex<Vec<Value>>,
}

impl FixedTransport {
    fn new(status: u16) -> Self {
        Self {
            status,
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeliveryTransport for FixedTransport {
    async fn deliver(&self, _subscriber: &Subscriber, payload: &Value) -> Result<DeliveryOutcome> {
        self.delivered.lock().expect("lock").push(payload.clone());
        if (200..300).contains(&self.status) {
            Ok(DeliveryOutcome {
                status_code:  self.status,
                body_summary: String::new(),
                duration_ms:  1.0,
            })
        } else {
            Err(PipelineError::DeliveryFailed {
                kind:    DeliveryErrorKind::Http5xx,
                code:    Some(self.status),
                message: format!("HTTP {}", self.status),
            })
        }
    }
}

fn engine_without_debounce(
    storage: Arc<MemoryStorage>,
    transport: Arc<dyn DeliveryTransport>,
) -> Arc<Engine> {
    let config = EngineConfig {
        debounce_secs: 0,
        ..EngineConfig::default()
    };
    Engine::new(config, storage, transport)
}

#[tokio::test]
async fn create_then_write_supersedes_the_write() {
    let storage = Arc::new(MemoryStorage::new());
    let engine =
        engine_without_debounce(storage, Arc::new(FixedTransport::new(200)));

    engine.save_rule(TrackingRule::new("sale.order", EventOp::Create)).await.expect("rule");
    engine.save_rule(TrackingRule::new("sale.order", EventOp::Write)).await.expect("rule");

    engine.on_created(&[Record::order(42, "draft")], &HookContext::new()).await;
    engine
        .on_written(&[Record::order(42, "confirmed")], &["state".to_string()], &HookContext::new())
        .await;

    let batch = engine.pull_events(&PullQuery::new(0, 100)).await.expect("pull");
    assert_eq!(batch.count, 1);
    assert_eq!(batch.events[0].op, EventOp::Create);
    assert_eq!(batch.events[0].payload["state"], json!("draft"));
}

#[tokio::test]
async fn write_then_create_purges_the_writes() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_without_debounce(storage, Arc::new(FixedTransport::new(200)));

    for _ in 0..3 {
        engine
            .append_event(NewEvent::new("sale.order", 99, EventOp::Write, json!({})))
            .await
            .expect("append");
    }
    engine
        .append_event(NewEvent::new("sale.order", 99, EventOp::Create, json!({})))
        .await
        .expect("append");

    let batch = engine.pull_events(&PullQuery::new(0, 100)).await.expect("pull");
    let for_record: Vec<_> = batch.events.iter().filter(|e| e.record_id == 99).collect();
    assert_eq!(for_record.len(), 1);
    assert_eq!(for_record[0].op, EventOp::Create);
}

#[tokio::test]
async fn exponential_backoff_ends_in_dead_letter() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_without_debounce(storage.clone(), Arc::new(FixedTransport::new(500)));

    let sub = engine
        .add_subscriber(Subscriber::new("bridge", "https://bridge.example.com/hooks"))
        .await
        .expect("subscriber");

    let mut rule = TrackingRule::new("sale.order", EventOp::Create);
    rule.subscribers = vec![sub.id];
    engine.save_rule(rule).await.expect("rule");

    engine.on_created(&[Record::order(1, "draft")], &HookContext::new()).await;

    let due = storage.select_due(Utc::now(), 10).await.expect("due");
    assert_eq!(due.len(), 1);
    let dispatch_id = due[0].id;

    // Five failing attempts; each failure doubles the delay
    // (60, 120, 240, 480s), the fifth exhausts the budget.
    let expected_delays = [60_i64, 120, 240, 480];
    for (attempt, expected) in expected_delays.iter().enumerate() {
        let before = Utc::now();
        let summary = maintenance::run_retry_sweep(&engine).await.expect("sweep");
        assert_eq!(summary.dead, 0, "dead too early on attempt {attempt}");

        let record = storage.get_dispatch(dispatch_id).await.expect("get").expect("exists");
        assert_eq!(record.status, DispatchStatus::Failed);
        assert_eq!(record.retry_count, attempt as u32 + 1);
        let delay = (record.next_retry_at.expect("scheduled") - before).num_seconds();
        assert!(
            (expected - 2..=expected + 2).contains(&delay),
            "attempt {attempt}: expected ~{expected}s, got {delay}s"
        );

        // Rewind the clock instead of waiting out the backoff.
        storage
            .postpone_dispatch(dispatch_id, Utc::now() - ChronoDuration::seconds(1))
            .await
            .expect("rewind");
    }

    let summary = maintenance::run_retry_sweep(&engine).await.expect("sweep");
    assert_eq!(summary.dead, 1);

    let record = storage.get_dispatch(dispatch_id).await.expect("get").expect("exists");
    assert_eq!(record.status, DispatchStatus::Dead);
    assert_eq!(record.retry_count, record.max_retries);

    let letters = storage.pending_dead_letters(10).await.expect("letters");
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].dispatch_id, dispatch_id);

    // A further pass does not touch the dead record.
    let summary = maintenance::run_retry_sweep(&engine).await.expect("sweep");
    assert_eq!(summary.sent + summary.dead, 0);
    assert_eq!(
        storage.pending_dead_letters(10).await.expect("letters").len(),
        1
    );
}

#[tokio::test]
async fn pull_cursor_and_ack_walk_the_log() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_without_debounce(storage, Arc::new(FixedTransport::new(200)));

    for i in 1..=7 {
        engine
            .append_event(NewEvent::new("sale.order", i, EventOp::Create, json!({"n": i})))
            .await
            .expect("append");
    }

    let batch = engine
        .pull_events(&PullQuery::new(2, 3))
        .await
        .expect("pull");
    assert_eq!(batch.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);
    assert_eq!(batch.last_id, 5);
    assert!(batch.has_more);

    // Pull idempotence: same cursor, same batch.
    let again = engine.pull_events(&PullQuery::new(2, 3)).await.expect("pull");
    assert_eq!(again.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);

    engine.mark_processed(&[3, 4, 5]).await.expect("ack");
    // Ack idempotence.
    engine.mark_processed(&[3, 4, 5]).await.expect("ack");

    let batch = engine.pull_events(&PullQuery::new(2, 3)).await.expect("pull");
    assert_eq!(batch.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![6, 7]);
    assert_eq!(batch.last_id, 7);
    assert!(!batch.has_more);
}

#[tokio::test]
async fn debounce_collapses_rapid_identical_writes() {
    let storage = Arc::new(MemoryStorage::new());
    // Default config: 3s window.
    let engine = Engine::new(
        EngineConfig::default(),
        storage,
        Arc::new(FixedTransport::new(200)),
    );

    engine.save_rule(TrackingRule::new("sale.order", EventOp::Write)).await.expect("rule");

    let changed = vec!["state".to_string()];
    engine
        .on_written(&[Record::order(17, "sale")], &changed, &HookContext::new())
        .await;
    engine
        .on_written(&[Record::order(17, "sale")], &changed, &HookContext::new())
        .await;

    let batch = engine.pull_events(&PullQuery::new(0, 100)).await.expect("pull");
    assert_eq!(batch.count, 1);

    let stats = engine.debounce_stats();
    assert_eq!(stats.fired, 1);
    assert_eq!(stats.suppressed, 1);
}

#[tokio::test]
async fn hook_failure_lands_in_error_sink_not_host() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_without_debounce(storage.clone(), Arc::new(FixedTransport::new(200)));

    engine.save_rule(TrackingRule::new("sale.order", EventOp::Create)).await.expect("rule");

    // record_id 0 forces the append to be rejected inside the pipeline;
    // the hook returns normally (the host commit is already durable).
    engine.on_created(&[Record::order(0, "draft")], &HookContext::new()).await;

    assert_eq!(engine.pull_events(&PullQuery::new(0, 10)).await.expect("pull").count, 0);

    let errors = storage.recent_errors(10).await.expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].model, "sale.order");
    assert_eq!(errors[0].record_id, 0);
    assert!(!errors[0].message.is_empty());
}

#[tokio::test]
async fn rule_update_is_visible_to_next_lookup() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_without_debounce(storage, Arc::new(FixedTransport::new(200)));

    let mut rule = engine
        .save_rule(TrackingRule::new("sale.order", EventOp::Create))
        .await
        .expect("rule");

    engine.on_created(&[Record::order(1, "draft")], &HookContext::new()).await;
    assert_eq!(engine.pull_events(&PullQuery::new(0, 10)).await.expect("pull").count, 1);

    // Deactivate: the very next hook invocation must see the change.
    rule.active = false;
    engine.save_rule(rule).await.expect("update");

    engine.on_created(&[Record::order(2, "draft")], &HookContext::new()).await;
    assert_eq!(engine.pull_events(&PullQuery::new(0, 10)).await.expect("pull").count, 1);
}

#[tokio::test]
async fn push_payload_matches_subscriber_contract() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(FixedTransport::new(200));
    let engine = engine_without_debounce(storage.clone(), transport.clone());

    let sub = engine
        .add_subscriber(Subscriber::new("bridge", "https://bridge.example.com/hooks"))
        .await
        .expect("subscriber");
    let mut rule = TrackingRule::new("sale.order", EventOp::Write);
    rule.subscribers = vec![sub.id];
    engine.save_rule(rule).await.expect("rule");

    engine
        .on_written(&[Record::order(42, "confirmed")], &["state".to_string()], &HookContext::new())
        .await;
    maintenance::run_retry_sweep(&engine).await.expect("sweep");

    let delivered = transport.delivered.lock().expect("lock").clone();
    assert_eq!(delivered.len(), 1);
    let payload = &delivered[0];

    assert!(payload["event_id"].is_i64());
    assert_eq!(payload["model"], json!("sale.order"));
    assert_eq!(payload["record_id"], json!(42));
    assert_eq!(payload["event"], json!("write"));
    assert_eq!(payload["priority"], json!("medium"));
    assert_eq!(payload["category"], json!("business"));
    assert_eq!(payload["changed_fields"], json!(["state"]));
    assert_eq!(payload["data"]["state"], json!("confirmed"));
    assert_eq!(payload["data"]["_changed_fields"], json!(["state"]));
    let meta = &payload["data"]["_metadata"];
    assert_eq!(meta["model"], json!("sale.order"));
    assert_eq!(meta["operation"], json!("write"));
}
