//! The universal interception hook.
//!
//! Hosts call [`Engine::on_created`], [`Engine::on_written`], and
//! [`Engine::on_deleted`] after performing the mutation. One hook covers
//! every model: the rule registry decides what is tracked, so no per-model
//! wiring exists. The hook must never fail the host's transaction: every
//! internal error is captured in the error sink and swallowed.
//!
//! For deletes the host captures record snapshots *before* unlink runs and
//! hands them to `on_deleted`; the live records no longer exist.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::{
    audit::{AuditAction, AuditRecord},
    dispatch::NewDispatch,
    engine::Engine,
    entity::{EntityRecord, HookContext},
    error::Result,
    event::{EventOp, NewEvent, Priority},
    filter::FilterParser,
    rules::TrackingRule,
    store::{AuditStore, DispatchStore, ErrorSink, EventLogStore, SubscriberStore},
};

impl Engine {
    /// Hook for freshly created records.
    pub async fn on_created(&self, records: &[Arc<dyn EntityRecord>], ctx: &HookContext) {
        for record in records {
            self.intercept(record.as_ref(), EventOp::Create, None, ctx).await;
        }
    }

    /// Hook for updated records, with the changed field names the host
    /// observed.
    pub async fn on_written(
        &self,
        records: &[Arc<dyn EntityRecord>],
        changed: &[String],
        ctx: &HookContext,
    ) {
        for record in records {
            self.intercept(record.as_ref(), EventOp::Write, Some(changed), ctx).await;
        }
    }

    /// Hook for deleted records, fed with snapshots captured before unlink.
    pub async fn on_deleted(&self, captured: &[Arc<dyn EntityRecord>], ctx: &HookContext) {
        for record in captured {
            self.intercept(record.as_ref(), EventOp::Unlink, None, ctx).await;
        }
    }

    /// One record through the pipeline. Never raises: failures land in the
    /// error sink.
    async fn intercept(
        &self,
        record: &dyn EntityRecord,
        op: EventOp,
        changed: Option<&[String]>,
        ctx: &HookContext,
    ) {
        if ctx.webhook_disabled {
            return;
        }

        let model = record.model();
        if !self.registry.is_tracked(model).await {
            return;
        }

        let rules = self.registry.rules_for(model, op).await;
        if rules.is_empty() {
            return;
        }

        // Widest per-rule debounce override, if any.
        let window_override = rules
            .iter()
            .map(|r| r.debounce_secs)
            .max()
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs);

        if !self.debouncer.should_fire(model, record.id(), op, window_override) {
            return;
        }

        for rule in &rules {
            if let Err(e) = self.apply_rule(record, rule, op, changed, ctx).await {
                error!(
                    model,
                    record_id = record.id(),
                    rule = rule.id,
                    error = %e,
                    "rule application failed"
                );
                self.sink_error(model, record.id(), &format!("rule {}: {e}", rule.id)).await;
            }
        }
    }

    async fn apply_rule(
        &self,
        record: &dyn EntityRecord,
        rule: &TrackingRule,
        op: EventOp,
        changed: Option<&[String]>,
        ctx: &HookContext,
    ) -> Result<()> {
        if op == EventOp::Write && !rule.matches_changed_fields(changed) {
            return Ok(());
        }

        if let Some(filter) = rule.filter.as_deref() {
            match FilterParser::new().parse_and_evaluate(filter, record) {
                Ok(true) => {},
                Ok(false) => {
                    debug!(rule = rule.id, record_id = record.id(), "filter did not match");
                    return Ok(());
                },
                Err(e) => {
                    // A broken filter must never drop events silently.
                    warn!(rule = rule.id, error = %e, "filter evaluation failed, defaulting to match");
                },
            }
        }

        let payload = self.payload_builder.build(record, Some(rule), op, changed);

        let outcome = self
            .storage
            .append_event(NewEvent {
                model:     record.model().to_string(),
                record_id: record.id(),
                op,
                payload:   payload.clone(),
                priority:  rule.priority,
                category:  rule.category,
                user_id:   ctx.user_id,
                rule_id:   Some(rule.id),
            })
            .await?;

        self.registry.touch_trigger(rule.id).await;

        debug!(
            model = record.model(),
            record_id = record.id(),
            rule = rule.id,
            event_id = ?outcome.id(),
            "event recorded"
        );

        if rule.test_mode || rule.subscribers.is_empty() {
            return Ok(());
        }

        let subscribers = self.storage.get_subscribers(&rule.subscribers).await?;
        let mut enqueued = Vec::new();

        for subscriber in subscribers.iter().filter(|s| s.enabled) {
            let max_retries = if subscriber.max_retries > 0 {
                subscriber.max_retries
            } else {
                self.config.default_max_retries
            };
            let dispatch = self
                .storage
                .enqueue_dispatch(NewDispatch {
                    event_log_id: outcome.id(),
                    model: record.model().to_string(),
                    record_id: record.id(),
                    op,
                    subscriber_id: subscriber.id,
                    payload: payload.clone(),
                    changed_fields: changed.map(<[String]>::to_vec).unwrap_or_default(),
                    priority: rule.priority,
                    category: rule.category,
                    max_retries,
                    template: rule.template.clone(),
                })
                .await?;

            if let Err(e) = self
                .storage
                .record_audit(AuditRecord::for_dispatch(dispatch.id, AuditAction::Created))
                .await
            {
                error!(dispatch_id = dispatch.id, error = %e, "failed to record enqueue audit");
            }

            enqueued.push(dispatch.id);
        }

        // Instant send runs on a background task, outside whatever
        // transaction boundary the host is still inside.
        if rule.instant_send && rule.priority == Priority::High {
            for dispatch_id in enqueued {
                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.process_by_id(dispatch_id).await {
                        error!(dispatch_id, error = %e, "instant send failed");
                    }
                });
            }
        }

        Ok(())
    }

    async fn sink_error(&self, model: &str, record_id: i64, message: &str) {
        if let Err(e) = self.storage.record_error(model, record_id, message).await {
            // Last resort: the sink itself failed. Log and move on, the
            // host commit is untouchable.
            error!(model, record_id, error = %e, "error sink write failed");
        }
    }
}
