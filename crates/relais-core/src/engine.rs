//! The pipeline engine: one value owning every shared collaborator.
//!
//! All process-wide state (rule cache, debounce map, dispatcher, worker
//! handles) lives here rather than in ambient globals; hosts construct one
//! `Engine` at startup, thread it through their hook wiring, and shut it
//! down on exit.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::EngineConfig,
    debounce::{DebounceStats, Debouncer},
    delivery::DeliveryTransport,
    dispatch::{DispatchSummary, Dispatcher},
    entity::EntityCatalog,
    error::Result,
    event::{AppendOutcome, LogStats, NewEvent, PullBatch, PullQuery},
    maintenance::{self, SweepLocks},
    payload::PayloadBuilder,
    rules::{RuleRegistry, TrackingRule},
    store::{EventLogStore, Storage, SubscriberStore, SyncStateStore},
    subscriber::Subscriber,
    sync::SyncState,
    template::{PlaceholderRenderer, TemplateRenderer},
};

/// The event pipeline engine.
pub struct Engine {
    pub(crate) config:          EngineConfig,
    pub(crate) storage:         Arc<dyn Storage>,
    pub(crate) registry:        RuleRegistry,
    pub(crate) debouncer:       Debouncer,
    pub(crate) payload_builder: PayloadBuilder,
    pub(crate) dispatcher:      Arc<Dispatcher>,
    pub(crate) catalog:         Option<Arc<dyn EntityCatalog>>,
    pub(crate) sweep_locks:     SweepLocks,
    shutdown:                   CancellationToken,
    workers:                    parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Engine with the default placeholder template renderer and no entity
    /// catalog.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Arc<Self> {
        Self::with_collaborators(config, storage, transport, Arc::new(PlaceholderRenderer::new()), None)
    }

    /// Engine with explicit collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn DeliveryTransport>,
        renderer: Arc<dyn TemplateRenderer>,
        catalog: Option<Arc<dyn EntityCatalog>>,
    ) -> Arc<Self> {
        let rule_store: Arc<dyn crate::store::RuleStore> = storage.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            transport,
            renderer.clone(),
            config.clone(),
        ));

        Arc::new(Self {
            debouncer: Debouncer::new(std::time::Duration::from_secs(config.debounce_secs)),
            registry: RuleRegistry::new(rule_store),
            payload_builder: PayloadBuilder::with_renderer(renderer),
            dispatcher,
            catalog,
            sweep_locks: SweepLocks::new(),
            shutdown: CancellationToken::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
            config,
            storage,
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The storage backend.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The rule registry (admin surface + cache).
    #[must_use]
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// The push dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Debounce counters for monitoring.
    #[must_use]
    pub fn debounce_stats(&self) -> DebounceStats {
        self.debouncer.stats()
    }

    /// Shutdown signal observed by background workers.
    #[must_use]
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the periodic maintenance workers.
    pub fn start_workers(self: &Arc<Self>) {
        let handles = maintenance::spawn_workers(Arc::clone(self));
        info!(workers = handles.len(), "maintenance workers started");
        self.workers.lock().extend(handles);
    }

    /// Stop background workers, waiting up to the configured grace period
    /// before abandoning in-flight work (reclaimed by the next retry sweep
    /// after restart).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let grace = std::time::Duration::from_secs(self.config.shutdown_grace_secs);

        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("worker did not drain within the grace period, abandoning");
            }
        }
        info!("engine shut down");
    }

    // ── Event log service ───────────────────────────────────────────────

    /// Append an event to the pull log (supersession applied).
    pub async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome> {
        self.storage.append_event(event).await
    }

    /// Cursor-based pull.
    pub async fn pull_events(&self, query: &PullQuery) -> Result<PullBatch> {
        self.storage.pull_events(query).await
    }

    /// Acknowledge events by id (idempotent).
    pub async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        self.storage.mark_processed(ids).await
    }

    /// Unacknowledged, unarchived event count (health surface).
    pub async fn pending_events(&self) -> Result<u64> {
        self.storage.pending_events().await
    }

    /// Event-log statistics over the trailing `days`.
    pub async fn stats(&self, days: u32) -> Result<LogStats> {
        let since = Utc::now() - ChronoDuration::days(i64::from(days));
        self.storage.log_stats(since, days).await
    }

    /// Advance a consumer's sync cursor after an acknowledgement.
    pub async fn record_ack_cursor(
        &self,
        user_id: i64,
        device_id: &str,
        app_type: &str,
        last_event_id: i64,
        event_count: u64,
    ) -> Result<SyncState> {
        let mut state =
            self.storage.get_or_create_sync_state(user_id, device_id, app_type).await?;
        state.record_sync(last_event_id, event_count);
        self.storage.update_sync_state(&state).await?;
        Ok(state)
    }

    // ── Admin surface ───────────────────────────────────────────────────

    /// Validate and persist a tracking rule (cache invalidated).
    pub async fn save_rule(&self, rule: TrackingRule) -> Result<TrackingRule> {
        self.registry.save_rule(rule, self.catalog.as_deref()).await
    }

    /// Delete a tracking rule (cache invalidated).
    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        self.registry.delete_rule(id).await
    }

    /// Validate and persist a subscriber.
    pub async fn add_subscriber(&self, subscriber: Subscriber) -> Result<Subscriber> {
        self.storage.insert_subscriber(subscriber).await
    }

    /// Run one dispatch pass immediately (also exercised by the retry
    /// sweep).
    pub async fn run_dispatch_pass(&self) -> Result<DispatchSummary> {
        self.dispatcher.run_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::EventOp,
        store::memory::MemoryStorage,
        testing::MockTransport,
    };
    use serde_json::json;

    fn engine() -> Arc<Engine> {
        Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MockTransport::succeeding()),
        )
    }

    #[tokio::test]
    async fn test_event_log_service_round_trip() {
        let engine = engine();

        let outcome = engine
            .append_event(NewEvent::new("sale.order", 1, EventOp::Create, json!({})))
            .await
            .expect("append");
        assert!(outcome.id().is_some());

        assert_eq!(engine.pending_events().await.expect("pending"), 1);

        let batch = engine.pull_events(&PullQuery::new(0, 10)).await.expect("pull");
        assert_eq!(batch.count, 1);

        engine.mark_processed(&[batch.last_id]).await.expect("ack");
        assert_eq!(engine.pending_events().await.expect("pending"), 0);

        let stats = engine.stats(7).await.expect("stats");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn test_ack_cursor_tracking() {
        let engine = engine();
        let state = engine
            .record_ack_cursor(7, "device-a", "mobile_app", 42, 10)
            .await
            .expect("cursor");
        assert_eq!(state.last_event_id, 42);
        assert_eq!(state.sync_count, 1);

        let state = engine
            .record_ack_cursor(7, "device-a", "mobile_app", 60, 5)
            .await
            .expect("cursor");
        assert_eq!(state.last_event_id, 60);
        assert_eq!(state.sync_count, 2);
        assert_eq!(state.total_events_synced, 15);
    }

    #[tokio::test]
    async fn test_worker_lifecycle_shutdown() {
        let engine = engine();
        engine.start_workers();
        // Shutdown must drain promptly even with freshly started workers.
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_rule_through_engine() {
        let engine = engine();
        let rule = engine
            .save_rule(TrackingRule::new("sale.order", EventOp::Create))
            .await
            .expect("save");
        assert!(rule.id > 0);
        assert!(engine.registry().is_tracked("sale.order").await);
    }
}
