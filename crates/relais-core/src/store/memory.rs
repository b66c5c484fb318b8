//! In-memory storage backend.
//!
//! The reference implementation of the storage semantics: a single mutexed
//! state, monotonic id counters per table, and the supersession/selection
//! logic expressed directly. Used by the test suite and for embedded runs
//! without PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    audit::AuditRecord,
    dispatch::{DeadLetter, DispatchFailure, DispatchRecord, DispatchStatus, NewDispatch, Resolution},
    error::{PipelineError, Result},
    event::{
        AppendOutcome, EventLogEntry, EventOp, LogStats, ModelCount, NewEvent, PullBatch, PullQuery,
    },
    rules::TrackingRule,
    store::{
        AuditStore, DeadLetterStore, DispatchStore, ErrorRecord, ErrorSink, EventLogStore,
        RuleStore, SubscriberStore, SyncStateStore,
    },
    subscriber::Subscriber,
    sync::SyncState,
};

#[derive(Debug, Default)]
struct Inner {
    next_rule_id:        i64,
    rules:               Vec<TrackingRule>,
    next_subscriber_id:  i64,
    subscribers:         Vec<Subscriber>,
    next_event_id:       i64,
    events:              Vec<EventLogEntry>,
    next_dispatch_id:    i64,
    dispatches:          Vec<DispatchRecord>,
    next_dead_letter_id: i64,
    dead_letters:        Vec<DeadLetter>,
    next_sync_id:        i64,
    sync_states:         Vec<SyncState>,
    next_audit_id:       i64,
    audits:              Vec<AuditRecord>,
    next_error_id:       i64,
    errors:              Vec<ErrorRecord>,
}

/// Mutex-guarded in-memory backend implementing every storage trait.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryStorage {
    async fn insert_rule(&self, mut rule: TrackingRule) -> Result<TrackingRule> {
        let mut inner = self.inner.lock();
        inner.next_rule_id += 1;
        rule.id = inner.next_rule_id;
        inner.rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: &TrackingRule) -> Result<()> {
        let mut inner = self.inner.lock();
        let existing = inner.rules.iter_mut().find(|r| r.id == rule.id).ok_or_else(|| {
            PipelineError::StorageError {
                reason: format!("rule {} not found", rule.id),
            }
        })?;
        *existing = rule.clone();
        Ok(())
    }

    async fn delete_rule(&self, id: i64) -> Result<()> {
        self.inner.lock().rules.retain(|r| r.id != id);
        Ok(())
    }

    async fn get_rule(&self, id: i64) -> Result<Option<TrackingRule>> {
        Ok(self.inner.lock().rules.iter().find(|r| r.id == id).cloned())
    }

    async fn active_rules(&self) -> Result<Vec<TrackingRule>> {
        Ok(self.inner.lock().rules.iter().filter(|r| r.active).cloned().collect())
    }

    async fn touch_rule_trigger(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(rule) = self.inner.lock().rules.iter_mut().find(|r| r.id == id) {
            rule.last_trigger = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for MemoryStorage {
    async fn insert_subscriber(&self, mut subscriber: Subscriber) -> Result<Subscriber> {
        subscriber.validate()?;
        let mut inner = self.inner.lock();
        inner.next_subscriber_id += 1;
        subscriber.id = inner.next_subscriber_id;
        inner.subscribers.push(subscriber.clone());
        Ok(subscriber)
    }

    async fn update_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        subscriber.validate()?;
        let mut inner = self.inner.lock();
        let existing = inner
            .subscribers
            .iter_mut()
            .find(|s| s.id == subscriber.id)
            .ok_or_else(|| PipelineError::StorageError {
                reason: format!("subscriber {} not found", subscriber.id),
            })?;
        *existing = subscriber.clone();
        Ok(())
    }

    async fn get_subscriber(&self, id: i64) -> Result<Option<Subscriber>> {
        Ok(self.inner.lock().subscribers.iter().find(|s| s.id == id).cloned())
    }

    async fn get_subscribers(&self, ids: &[i64]) -> Result<Vec<Subscriber>> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.subscribers.iter().find(|s| s.id == *id).cloned())
            .collect())
    }

    async fn record_subscriber_outcome(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(sub) = self.inner.lock().subscribers.iter_mut().find(|s| s.id == id) {
            if success {
                sub.last_success_at = Some(at);
            } else {
                sub.last_failure_at = Some(at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventLogStore for MemoryStorage {
    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome> {
        if event.record_id == 0 {
            return Err(PipelineError::AppendRejected {
                reason: "record_id 0 is forbidden (negative ids mark synthetic events)"
                    .to_string(),
            });
        }

        // The mutex serializes supersession per (model, record_id); the
        // PostgreSQL backend uses row locks for the same effect.
        let mut inner = self.inner.lock();

        let pair =
            |e: &EventLogEntry| e.model == event.model && e.record_id == event.record_id;

        match event.op {
            EventOp::Write => {
                // Absorbed when an unarchived create with no later unlink
                // already holds the record's full state.
                let latest_create = inner
                    .events
                    .iter()
                    .filter(|e| pair(e) && e.op == EventOp::Create && !e.is_archived)
                    .map(|e| e.id)
                    .max();
                if let Some(create_id) = latest_create {
                    let unlinked_since = inner
                        .events
                        .iter()
                        .any(|e| pair(e) && e.op == EventOp::Unlink && e.id > create_id);
                    if !unlinked_since {
                        tracing::debug!(
                            model = %event.model,
                            record_id = event.record_id,
                            "write absorbed by existing create"
                        );
                        return Ok(AppendOutcome::AbsorbedByCreate);
                    }
                }
            },
            EventOp::Create => {},
            EventOp::Unlink => {},
        }

        let superseded_writes = if event.op == EventOp::Create {
            let before = inner.events.len();
            inner.events.retain(|e| !(pair(e) && e.op == EventOp::Write));
            before - inner.events.len()
        } else {
            0
        };

        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.events.push(EventLogEntry {
            id,
            model: event.model,
            record_id: event.record_id,
            op: event.op,
            payload: event.payload,
            priority: event.priority,
            category: event.category,
            timestamp: Utc::now(),
            user_id: event.user_id,
            rule_id: event.rule_id,
            is_processed: false,
            processed_at: None,
            is_archived: false,
            archived_at: None,
        });

        Ok(AppendOutcome::Appended {
            id,
            superseded_writes,
        })
    }

    async fn pull_events(&self, query: &PullQuery) -> Result<PullBatch> {
        let inner = self.inner.lock();

        let matches = |e: &EventLogEntry| {
            e.id > query.last_event_id
                && !e.is_processed
                && !e.is_archived
                && query.models.as_ref().is_none_or(|m| m.contains(&e.model))
                && query.priority.is_none_or(|p| e.priority == p)
        };

        let mut events: Vec<EventLogEntry> =
            inner.events.iter().filter(|e| matches(e)).cloned().collect();
        events.sort_by_key(|e| e.id);

        let has_more = events.len() > query.limit;
        events.truncate(query.limit);

        let last_id = events.last().map_or(query.last_event_id, |e| e.id);
        let count = events.len();

        Ok(PullBatch {
            events,
            last_id,
            has_more,
            count,
        })
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut matched = 0;
        for event in &mut inner.events {
            if ids.contains(&event.id) {
                matched += 1;
                if !event.is_processed {
                    event.is_processed = true;
                    event.processed_at = Some(now);
                }
            }
        }
        Ok(matched)
    }

    async fn pending_events(&self) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .events
            .iter()
            .filter(|e| !e.is_processed && !e.is_archived)
            .count() as u64)
    }

    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut archived = 0;
        for event in &mut inner.events {
            if event.is_processed && !event.is_archived && event.timestamp < cutoff {
                event.is_archived = true;
                event.archived_at = Some(now);
                archived += 1;
            }
        }
        Ok(archived)
    }

    async fn delete_archived_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.events.len();
        inner.events.retain(|e| !(e.is_archived && e.timestamp < cutoff));
        Ok((before - inner.events.len()) as u64)
    }

    async fn log_stats(&self, since: DateTime<Utc>, period_days: u32) -> Result<LogStats> {
        let inner = self.inner.lock();
        let window: Vec<&EventLogEntry> =
            inner.events.iter().filter(|e| e.timestamp >= since).collect();

        let total = window.len() as u64;
        let processed = window.iter().filter(|e| e.is_processed).count() as u64;
        let pending = window.iter().filter(|e| !e.is_processed && !e.is_archived).count() as u64;
        let archived = window.iter().filter(|e| e.is_archived).count() as u64;

        let mut model_counts: std::collections::HashMap<&str, u64> =
            std::collections::HashMap::new();
        let mut by_priority: std::collections::BTreeMap<String, u64> =
            std::collections::BTreeMap::new();
        for event in &window {
            *model_counts.entry(event.model.as_str()).or_default() += 1;
            *by_priority.entry(event.priority.as_str().to_string()).or_default() += 1;
        }

        let mut by_model: Vec<ModelCount> = model_counts
            .into_iter()
            .map(|(model, count)| ModelCount {
                model: model.to_string(),
                count,
            })
            .collect();
        by_model.sort_by(|a, b| b.count.cmp(&a.count).then(a.model.cmp(&b.model)));
        by_model.truncate(10);

        Ok(LogStats {
            period_days,
            total,
            processed,
            pending,
            archived,
            by_model,
            by_priority,
        })
    }

    async fn live_record_refs(&self) -> Result<Vec<(String, i64)>> {
        let inner = self.inner.lock();
        let mut refs: Vec<(String, i64)> = inner
            .events
            .iter()
            .filter(|e| e.record_id > 0)
            .map(|e| (e.model.clone(), e.record_id))
            .collect();
        refs.sort();
        refs.dedup();
        Ok(refs)
    }

    async fn delete_events_for_record(&self, model: &str, record_id: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.events.len();
        inner.events.retain(|e| !(e.model == model && e.record_id == record_id));
        Ok((before - inner.events.len()) as u64)
    }
}

#[async_trait]
impl DispatchStore for MemoryStorage {
    async fn enqueue_dispatch(&self, dispatch: NewDispatch) -> Result<DispatchRecord> {
        let mut inner = self.inner.lock();
        inner.next_dispatch_id += 1;
        let record = DispatchRecord {
            id:             inner.next_dispatch_id,
            event_log_id:   dispatch.event_log_id,
            model:          dispatch.model,
            record_id:      dispatch.record_id,
            op:             dispatch.op,
            subscriber_id:  dispatch.subscriber_id,
            payload:        dispatch.payload,
            changed_fields: dispatch.changed_fields,
            priority:       dispatch.priority,
            category:       dispatch.category,
            status:         DispatchStatus::Pending,
            retry_count:    0,
            max_retries:    dispatch.max_retries,
            next_retry_at:  None,
            last_error:     None,
            timestamp:      Utc::now(),
            started_at:     None,
            sent_at:        None,
            response_code:  None,
            processing_ms:  None,
            template:       dispatch.template,
        };
        inner.dispatches.push(record.clone());
        Ok(record)
    }

    async fn get_dispatch(&self, id: i64) -> Result<Option<DispatchRecord>> {
        Ok(self.inner.lock().dispatches.iter().find(|d| d.id == id).cloned())
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchRecord>> {
        let inner = self.inner.lock();
        let mut due: Vec<DispatchRecord> = inner
            .dispatches
            .iter()
            .filter(|d| match d.status {
                DispatchStatus::Pending => d.next_retry_at.is_none_or(|at| at <= now),
                DispatchStatus::Failed => {
                    d.retry_count < d.max_retries
                        && d.next_retry_at.is_some_and(|at| at <= now)
                },
                DispatchStatus::Processing | DispatchStatus::Sent | DispatchStatus::Dead => false,
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_dispatch(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.dispatches.iter_mut().find(|d| d.id == id) else {
            return Ok(false);
        };
        match record.status {
            DispatchStatus::Pending | DispatchStatus::Failed => {
                record.status = DispatchStatus::Processing;
                record.started_at = Some(now);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn mark_sent(
        &self,
        id: i64,
        at: DateTime<Utc>,
        response_code: u16,
        processing_ms: f64,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = find_dispatch(&mut inner, id)?;
        record.status = DispatchStatus::Sent;
        record.sent_at = Some(at);
        record.response_code = Some(response_code);
        record.processing_ms = Some(processing_ms);
        record.next_retry_at = None;
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        failure: &DispatchFailure,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = find_dispatch(&mut inner, id)?;
        record.status = DispatchStatus::Failed;
        record.retry_count = retry_count;
        record.next_retry_at = Some(next_retry_at);
        record.last_error = Some(failure.clone());
        Ok(())
    }

    async fn mark_dead(&self, id: i64, retry_count: u32, failure: &DispatchFailure) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = find_dispatch(&mut inner, id)?;
        record.status = DispatchStatus::Dead;
        record.retry_count = retry_count;
        record.next_retry_at = None;
        record.last_error = Some(failure.clone());
        Ok(())
    }

    async fn postpone_dispatch(&self, id: i64, until: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = find_dispatch(&mut inner, id)?;
        record.next_retry_at = Some(until);
        Ok(())
    }

    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut reclaimed = 0;
        for record in &mut inner.dispatches {
            if record.status == DispatchStatus::Processing
                && record.started_at.is_some_and(|at| at < cutoff)
            {
                record.status = DispatchStatus::Pending;
                record.started_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn sent_count_since(&self, subscriber_id: i64, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .dispatches
            .iter()
            .filter(|d| {
                d.subscriber_id == subscriber_id
                    && d.status == DispatchStatus::Sent
                    && d.sent_at.is_some_and(|at| at >= cutoff)
            })
            .count() as u64)
    }
}

fn find_dispatch<'a>(inner: &'a mut Inner, id: i64) -> Result<&'a mut DispatchRecord> {
    inner
        .dispatches
        .iter_mut()
        .find(|d| d.id == id)
        .ok_or_else(|| PipelineError::StorageError {
            reason: format!("dispatch {id} not found"),
        })
}

#[async_trait]
impl DeadLetterStore for MemoryStorage {
    async fn create_dead_letter(&self, mut letter: DeadLetter) -> Result<DeadLetter> {
        let mut inner = self.inner.lock();
        if let Some(existing) =
            inner.dead_letters.iter().find(|l| l.dispatch_id == letter.dispatch_id)
        {
            return Ok(existing.clone());
        }
        inner.next_dead_letter_id += 1;
        letter.id = inner.next_dead_letter_id;
        inner.dead_letters.push(letter.clone());
        Ok(letter)
    }

    async fn pending_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self
            .inner
            .lock()
            .dead_letters
            .iter()
            .filter(|l| l.resolution == Resolution::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolution: Resolution,
        resolver: Option<i64>,
        notes: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let letter = inner.dead_letters.iter_mut().find(|l| l.id == id).ok_or_else(|| {
            PipelineError::StorageError {
                reason: format!("dead letter {id} not found"),
            }
        })?;
        letter.resolution = resolution;
        letter.resolver = resolver;
        letter.resolved_at = Some(Utc::now());
        letter.notes = notes;
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for MemoryStorage {
    async fn get_or_create_sync_state(
        &self,
        user_id: i64,
        device_id: &str,
        app_type: &str,
    ) -> Result<SyncState> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner
            .sync_states
            .iter_mut()
            .find(|s| s.user_id == user_id && s.device_id == device_id)
        {
            if state.app_type != app_type {
                state.app_type = app_type.to_string();
            }
            return Ok(state.clone());
        }
        inner.next_sync_id += 1;
        let mut state = SyncState::new(user_id, device_id, app_type);
        state.id = inner.next_sync_id;
        inner.sync_states.push(state.clone());
        Ok(state)
    }

    async fn update_sync_state(&self, state: &SyncState) -> Result<()> {
        let mut inner = self.inner.lock();
        let existing =
            inner.sync_states.iter_mut().find(|s| s.id == state.id).ok_or_else(|| {
                PipelineError::StorageError {
                    reason: format!("sync state {} not found", state.id),
                }
            })?;
        *existing = state.clone();
        Ok(())
    }

    async fn cleanup_sync_states(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.sync_states.len();
        inner
            .sync_states
            .retain(|s| s.active || s.last_sync_time.is_none_or(|t| t >= cutoff));
        Ok((before - inner.sync_states.len()) as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStorage {
    async fn record_audit(&self, mut record: AuditRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.next_audit_id += 1;
        record.id = inner.next_audit_id;
        inner.audits.push(record);
        Ok(())
    }

    async fn audit_for_dispatch(&self, dispatch_id: i64) -> Result<Vec<AuditRecord>> {
        let mut records: Vec<AuditRecord> = self
            .inner
            .lock()
            .audits
            .iter()
            .filter(|a| a.dispatch_id == Some(dispatch_id))
            .cloned()
            .collect();
        records.sort_by_key(|a| a.id);
        Ok(records)
    }

    async fn cleanup_audit(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.audits.len();
        inner.audits.retain(|a| a.timestamp >= cutoff);
        Ok((before - inner.audits.len()) as u64)
    }
}

#[async_trait]
impl ErrorSink for MemoryStorage {
    async fn record_error(&self, model: &str, record_id: i64, message: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.next_error_id += 1;
        let record = ErrorRecord {
            id:        inner.next_error_id,
            model:     model.to_string(),
            record_id,
            message:   message.to_string(),
            timestamp: Utc::now(),
        };
        inner.errors.push(record);
        Ok(())
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>> {
        let inner = self.inner.lock();
        Ok(inner.errors.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::event::{Category, Priority};

    fn event(model: &str, record_id: i64, op: EventOp) -> NewEvent {
        NewEvent::new(model, record_id, op, json!({"op": op.as_str()}))
    }

    #[tokio::test]
    async fn test_ids_strictly_monotone() {
        let storage = MemoryStorage::new();
        let mut last = 0;
        for i in 1..=10 {
            let outcome =
                storage.append_event(event("sale.order", i, EventOp::Create)).await.expect("append");
            let id = outcome.id().expect("appended");
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_record_id_zero_rejected() {
        let storage = MemoryStorage::new();
        let result = storage.append_event(event("sale.order", 0, EventOp::Create)).await;
        assert!(matches!(result, Err(PipelineError::AppendRejected { .. })));

        // Negative ids are synthetic but accepted.
        let outcome =
            storage.append_event(event("sale.order", -1, EventOp::Create)).await.expect("append");
        assert!(outcome.id().is_some());
    }

    #[tokio::test]
    async fn test_write_after_create_absorbed() {
        let storage = MemoryStorage::new();
        storage.append_event(event("sale.order", 42, EventOp::Create)).await.expect("append");
        let outcome =
            storage.append_event(event("sale.order", 42, EventOp::Write)).await.expect("append");
        assert_eq!(outcome, AppendOutcome::AbsorbedByCreate);

        let batch = storage.pull_events(&PullQuery::new(0, 100)).await.expect("pull");
        assert_eq!(batch.count, 1);
        assert_eq!(batch.events[0].op, EventOp::Create);
    }

    #[tokio::test]
    async fn test_create_purges_prior_writes() {
        let storage = MemoryStorage::new();
        for _ in 0..3 {
            storage.append_event(event("sale.order", 99, EventOp::Write)).await.expect("append");
        }
        let outcome =
            storage.append_event(event("sale.order", 99, EventOp::Create)).await.expect("append");
        assert!(matches!(
            outcome,
            AppendOutcome::Appended {
                superseded_writes: 3,
                ..
            }
        ));

        let batch = storage.pull_events(&PullQuery::new(0, 100)).await.expect("pull");
        assert_eq!(batch.count, 1);
        assert_eq!(batch.events[0].op, EventOp::Create);
    }

    #[tokio::test]
    async fn test_unlink_always_appends_and_reopens_writes() {
        let storage = MemoryStorage::new();
        storage.append_event(event("sale.order", 7, EventOp::Create)).await.expect("append");
        storage.append_event(event("sale.order", 7, EventOp::Unlink)).await.expect("append");
        // The record id was re-used by the host after the unlink: writes
        // append again.
        let outcome =
            storage.append_event(event("sale.order", 7, EventOp::Write)).await.expect("append");
        assert!(outcome.id().is_some());

        let batch = storage.pull_events(&PullQuery::new(0, 100)).await.expect("pull");
        let ops: Vec<EventOp> = batch.events.iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![EventOp::Create, EventOp::Unlink, EventOp::Write]);
    }

    #[tokio::test]
    async fn test_supersession_scoped_per_record() {
        let storage = MemoryStorage::new();
        storage.append_event(event("sale.order", 1, EventOp::Create)).await.expect("append");
        let other =
            storage.append_event(event("sale.order", 2, EventOp::Write)).await.expect("append");
        assert!(other.id().is_some());
        let other_model =
            storage.append_event(event("res.partner", 1, EventOp::Write)).await.expect("append");
        assert!(other_model.id().is_some());
    }

    #[tokio::test]
    async fn test_pull_cursor_pagination_and_ack() {
        let storage = MemoryStorage::new();
        for i in 1..=7 {
            storage.append_event(event("sale.order", i, EventOp::Create)).await.expect("append");
        }

        let batch = storage.pull_events(&PullQuery::new(2, 3)).await.expect("pull");
        assert_eq!(batch.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(batch.last_id, 5);
        assert!(batch.has_more);

        let marked = storage.mark_processed(&[3, 4, 5]).await.expect("ack");
        assert_eq!(marked, 3);

        let batch = storage.pull_events(&PullQuery::new(2, 3)).await.expect("pull");
        assert_eq!(batch.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![6, 7]);
        assert_eq!(batch.last_id, 7);
        assert!(!batch.has_more);
    }

    #[tokio::test]
    async fn test_pull_empty_echoes_cursor() {
        let storage = MemoryStorage::new();
        let batch = storage.pull_events(&PullQuery::new(55, 10)).await.expect("pull");
        assert_eq!(batch.last_id, 55);
        assert_eq!(batch.count, 0);
        assert!(!batch.has_more);
    }

    #[tokio::test]
    async fn test_pull_filters_models_and_priority() {
        let storage = MemoryStorage::new();
        let mut high = event("sale.order", 1, EventOp::Create);
        high.priority = Priority::High;
        storage.append_event(high).await.expect("append");
        storage.append_event(event("res.partner", 2, EventOp::Create)).await.expect("append");

        let query = PullQuery::new(0, 10).with_models(vec!["sale.order".to_string()]);
        let batch = storage.pull_events(&query).await.expect("pull");
        assert_eq!(batch.count, 1);
        assert_eq!(batch.events[0].model, "sale.order");

        let query = PullQuery::new(0, 10).with_priority(Priority::High);
        let batch = storage.pull_events(&query).await.expect("pull");
        assert_eq!(batch.count, 1);
        assert_eq!(batch.events[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_ack_idempotent() {
        let storage = MemoryStorage::new();
        storage.append_event(event("sale.order", 1, EventOp::Create)).await.expect("append");

        let first = storage.mark_processed(&[1]).await.expect("ack");
        let second = storage.mark_processed(&[1]).await.expect("ack");
        assert_eq!(first, 1);
        assert_eq!(second, 1);

        // Unknown ids are ignored.
        let unknown = storage.mark_processed(&[999]).await.expect("ack");
        assert_eq!(unknown, 0);
    }

    #[tokio::test]
    async fn test_archive_then_delete_sweeps() {
        let storage = MemoryStorage::new();
        storage.append_event(event("sale.order", 1, EventOp::Create)).await.expect("append");
        storage.mark_processed(&[1]).await.expect("ack");

        let future = Utc::now() + chrono::Duration::seconds(5);
        let archived = storage.archive_older_than(future).await.expect("archive");
        assert_eq!(archived, 1);
        // Idempotent.
        assert_eq!(storage.archive_older_than(future).await.expect("archive"), 0);

        // Archived events disappear from pulls.
        let batch = storage.pull_events(&PullQuery::new(0, 10)).await.expect("pull");
        assert_eq!(batch.count, 0);

        let deleted = storage.delete_archived_older_than(future).await.expect("delete");
        assert_eq!(deleted, 1);
        assert_eq!(storage.delete_archived_older_than(future).await.expect("delete"), 0);
    }

    #[tokio::test]
    async fn test_unprocessed_events_not_archived() {
        let storage = MemoryStorage::new();
        storage.append_event(event("sale.order", 1, EventOp::Create)).await.expect("append");

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(storage.archive_older_than(future).await.expect("archive"), 0);
    }

    #[tokio::test]
    async fn test_log_stats_window() {
        let storage = MemoryStorage::new();
        for i in 1..=3 {
            storage.append_event(event("sale.order", i, EventOp::Create)).await.expect("append");
        }
        storage.append_event(event("res.partner", 4, EventOp::Create)).await.expect("append");
        storage.mark_processed(&[1]).await.expect("ack");

        let since = Utc::now() - chrono::Duration::days(7);
        let stats = storage.log_stats(since, 7).await.expect("stats");
        assert_eq!(stats.total, 4);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.by_model[0].model, "sale.order");
        assert_eq!(stats.by_model[0].count, 3);
        assert_eq!(stats.by_priority.get("medium"), Some(&4));
    }

    #[tokio::test]
    async fn test_reclaim_stuck_processing() {
        let storage = MemoryStorage::new();
        let sub = storage
            .insert_subscriber(Subscriber::new("s", "https://example.com"))
            .await
            .expect("subscriber");
        let record = storage
            .enqueue_dispatch(crate::dispatch::NewDispatch {
                event_log_id:   None,
                model:          "sale.order".to_string(),
                record_id:      1,
                op:             EventOp::Create,
                subscriber_id:  sub.id,
                payload:        json!({}),
                changed_fields: vec![],
                priority:       Priority::Medium,
                category:       Category::Business,
                max_retries:    5,
                template:       None,
            })
            .await
            .expect("enqueue");

        assert!(storage.claim_dispatch(record.id, Utc::now()).await.expect("claim"));
        // A second claim loses the race.
        assert!(!storage.claim_dispatch(record.id, Utc::now()).await.expect("claim"));

        let reclaimed =
            storage.reclaim_stuck(Utc::now() + chrono::Duration::seconds(1)).await.expect("reclaim");
        assert_eq!(reclaimed, 1);

        let record = storage.get_dispatch(record.id).await.expect("get").expect("exists");
        assert_eq!(record.status, DispatchStatus::Pending);
        assert!(record.started_at.is_none());
    }

    #[tokio::test]
    async fn test_error_sink_capture() {
        let storage = MemoryStorage::new();
        storage.record_error("sale.order", 42, "boom").await.expect("record");

        let errors = storage.recent_errors(10).await.expect("list");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].model, "sale.order");
        assert_eq!(errors[0].record_id, 42);
        assert_eq!(errors[0].message, "boom");
    }

    #[tokio::test]
    async fn test_sync_state_unique_per_user_device() {
        let storage = MemoryStorage::new();
        let a = storage
            .get_or_create_sync_state(1, "dev-a", "mobile_app")
            .await
            .expect("create");
        let same = storage
            .get_or_create_sync_state(1, "dev-a", "sales_app")
            .await
            .expect("get");
        assert_eq!(a.id, same.id);
        // app_type refreshed on re-registration.
        assert_eq!(same.app_type, "sales_app");

        let other = storage
            .get_or_create_sync_state(1, "dev-b", "mobile_app")
            .await
            .expect("create");
        assert_ne!(a.id, other.id);
    }

    proptest! {
        // Any interleaving of operations on one record keeps the log ids
        // strictly increasing, and a surviving create (with no later unlink)
        // means no write rows survive for the pair.
        #[test]
        fn prop_supersession_invariants(ops in proptest::collection::vec(0_u8..3, 1..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            runtime.block_on(async {
                let storage = MemoryStorage::new();
                for op in ops {
                    let op = match op {
                        0 => EventOp::Create,
                        1 => EventOp::Write,
                        _ => EventOp::Unlink,
                    };
                    storage
                        .append_event(NewEvent::new("sale.order", 5, op, json!({})))
                        .await
                        .expect("append");
                }

                let batch = storage
                    .pull_events(&PullQuery::new(0, 1000))
                    .await
                    .expect("pull");
                let ids: Vec<i64> = batch.events.iter().map(|e| e.id).collect();
                let mut sorted = ids.clone();
                sorted.sort_unstable();
                sorted.dedup();
                prop_assert_eq!(&ids, &sorted);

                if let Some(create_id) = batch
                    .events
                    .iter()
                    .filter(|e| e.op == EventOp::Create)
                    .map(|e| e.id)
                    .max()
                {
                    let unlink_after = batch
                        .events
                        .iter()
                        .any(|e| e.op == EventOp::Unlink && e.id > create_id);
                    if !unlink_after {
                        prop_assert!(!batch.events.iter().any(|e| e.op == EventOp::Write && e.id > create_id));
                    }
                }
                Ok(())
            })?;
        }
    }
}
