//! PostgreSQL storage backend.
//!
//! Runtime (non-macro) sqlx queries against seven tables; see
//! [`PostgresStorage::ensure_schema`] for the bootstrap DDL and the
//! composite indexes serving the pull query, the sweeps, and per-model /
//! per-priority access. Supersession is serialized per `(model, record_id)`
//! with `SELECT ... FOR UPDATE` inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    audit::{AuditAction, AuditRecord},
    dispatch::{DeadLetter, DispatchFailure, DispatchRecord, NewDispatch, Resolution},
    error::{PipelineError, Result},
    event::{
        AppendOutcome, EventLogEntry, EventOp, LogStats, ModelCount, NewEvent, PullBatch, PullQuery,
    },
    rules::TrackingRule,
    store::{
        AuditStore, DeadLetterStore, DispatchStore, ErrorRecord, ErrorSink, EventLogStore,
        RuleStore, SubscriberStore, SyncStateStore,
    },
    subscriber::{AuthKind, Subscriber},
    sync::SyncState,
};

/// Bootstrap DDL: tables, constraints, and the composite indexes backing
/// the hot queries.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS relais_rules (
    id              BIGSERIAL PRIMARY KEY,
    name            TEXT NOT NULL,
    sequence        INT NOT NULL DEFAULT 10,
    active          BOOLEAN NOT NULL DEFAULT TRUE,
    model           TEXT NOT NULL,
    operation       TEXT NOT NULL,
    filter          TEXT,
    tracked_fields  JSONB NOT NULL DEFAULT '[]',
    subscribers     JSONB NOT NULL DEFAULT '[]',
    template        TEXT,
    priority        TEXT NOT NULL DEFAULT 'medium',
    category        TEXT NOT NULL DEFAULT 'business',
    instant_send    BOOLEAN NOT NULL DEFAULT FALSE,
    rate_limit      INT NOT NULL DEFAULT 0 CHECK (rate_limit >= 0),
    debounce_secs   BIGINT NOT NULL DEFAULT 0 CHECK (debounce_secs >= 0),
    test_mode       BOOLEAN NOT NULL DEFAULT FALSE,
    last_trigger    TIMESTAMPTZ,
    description     TEXT
);
CREATE INDEX IF NOT EXISTS idx_relais_rules_lookup
    ON relais_rules (model, operation) WHERE active;

CREATE TABLE IF NOT EXISTS relais_subscribers (
    id               BIGSERIAL PRIMARY KEY,
    name             TEXT NOT NULL,
    endpoint_url     TEXT NOT NULL UNIQUE,
    auth             JSONB NOT NULL DEFAULT '{"type":"none"}',
    timeout_secs     BIGINT NOT NULL DEFAULT 30 CHECK (timeout_secs > 0),
    verify_tls       BOOLEAN NOT NULL DEFAULT TRUE,
    rate_limit       INT NOT NULL DEFAULT 0 CHECK (rate_limit >= 0),
    rate_window_secs BIGINT NOT NULL DEFAULT 60,
    custom_headers   JSONB NOT NULL DEFAULT '{}',
    enabled          BOOLEAN NOT NULL DEFAULT TRUE,
    max_retries      INT NOT NULL DEFAULT 5,
    last_success_at  TIMESTAMPTZ,
    last_failure_at  TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS relais_event_log (
    id           BIGSERIAL PRIMARY KEY,
    model        TEXT NOT NULL,
    record_id    BIGINT NOT NULL CHECK (record_id <> 0),
    op           TEXT NOT NULL,
    payload      JSONB NOT NULL DEFAULT '{}',
    priority     TEXT NOT NULL DEFAULT 'medium',
    category     TEXT NOT NULL DEFAULT 'business',
    timestamp    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    user_id      BIGINT,
    rule_id      BIGINT,
    is_processed BOOLEAN NOT NULL DEFAULT FALSE,
    processed_at TIMESTAMPTZ,
    is_archived  BOOLEAN NOT NULL DEFAULT FALSE,
    archived_at  TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_relais_event_log_pull
    ON relais_event_log (id) WHERE NOT is_processed AND NOT is_archived;
CREATE INDEX IF NOT EXISTS idx_relais_event_log_record
    ON relais_event_log (model, record_id);
CREATE INDEX IF NOT EXISTS idx_relais_event_log_model_time
    ON relais_event_log (model, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_relais_event_log_cleanup
    ON relais_event_log (is_processed, timestamp) WHERE is_processed;
CREATE INDEX IF NOT EXISTS idx_relais_event_log_archive
    ON relais_event_log (is_archived, timestamp);
CREATE INDEX IF NOT EXISTS idx_relais_event_log_priority
    ON relais_event_log (priority, is_processed, timestamp DESC);

CREATE TABLE IF NOT EXISTS relais_dispatch (
    id             BIGSERIAL PRIMARY KEY,
    event_log_id   BIGINT,
    model          TEXT NOT NULL,
    record_id      BIGINT NOT NULL,
    op             TEXT NOT NULL,
    subscriber_id  BIGINT NOT NULL,
    payload        JSONB NOT NULL DEFAULT '{}',
    changed_fields JSONB NOT NULL DEFAULT '[]',
    priority       TEXT NOT NULL DEFAULT 'medium',
    category       TEXT NOT NULL DEFAULT 'business',
    status         TEXT NOT NULL DEFAULT 'pending',
    retry_count    INT NOT NULL DEFAULT 0,
    max_retries    INT NOT NULL DEFAULT 5,
    next_retry_at  TIMESTAMPTZ,
    error_kind     TEXT,
    error_code     INT,
    error_message  TEXT,
    timestamp      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at     TIMESTAMPTZ,
    sent_at        TIMESTAMPTZ,
    response_code  INT,
    processing_ms  DOUBLE PRECISION,
    template       TEXT,
    CONSTRAINT chk_relais_dispatch_retries CHECK (retry_count <= max_retries)
);
CREATE INDEX IF NOT EXISTS idx_relais_dispatch_due
    ON relais_dispatch (status, next_retry_at) WHERE status IN ('pending', 'failed');
CREATE INDEX IF NOT EXISTS idx_relais_dispatch_subscriber
    ON relais_dispatch (subscriber_id, status, sent_at DESC);
CREATE INDEX IF NOT EXISTS idx_relais_dispatch_processing
    ON relais_dispatch (started_at) WHERE status = 'processing';

CREATE TABLE IF NOT EXISTS relais_dead_letters (
    id             BIGSERIAL PRIMARY KEY,
    dispatch_id    BIGINT NOT NULL UNIQUE,
    failed_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    retry_attempts INT NOT NULL DEFAULT 0,
    original_error TEXT NOT NULL DEFAULT '',
    resolution     TEXT NOT NULL DEFAULT 'pending',
    resolver       BIGINT,
    resolved_at    TIMESTAMPTZ,
    notes          TEXT
);

CREATE TABLE IF NOT EXISTS relais_sync_state (
    id                  BIGSERIAL PRIMARY KEY,
    user_id             BIGINT NOT NULL,
    device_id           TEXT NOT NULL,
    app_type            TEXT NOT NULL,
    last_event_id       BIGINT NOT NULL DEFAULT 0 CHECK (last_event_id >= 0),
    last_sync_time      TIMESTAMPTZ,
    sync_count          BIGINT NOT NULL DEFAULT 0,
    last_event_count    BIGINT NOT NULL DEFAULT 0,
    total_events_synced BIGINT NOT NULL DEFAULT 0,
    active              BOOLEAN NOT NULL DEFAULT TRUE,
    CONSTRAINT uq_relais_sync_state UNIQUE (user_id, device_id)
);

CREATE TABLE IF NOT EXISTS relais_audit (
    id          BIGSERIAL PRIMARY KEY,
    dispatch_id BIGINT,
    action      TEXT NOT NULL,
    timestamp   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    user_id     BIGINT,
    old_values  JSONB,
    new_values  JSONB,
    note        TEXT
);
CREATE INDEX IF NOT EXISTS idx_relais_audit_dispatch
    ON relais_audit (dispatch_id, id);
CREATE INDEX IF NOT EXISTS idx_relais_audit_time
    ON relais_audit (timestamp);

CREATE TABLE IF NOT EXISTS relais_errors (
    id        BIGSERIAL PRIMARY KEY,
    model     TEXT NOT NULL,
    record_id BIGINT NOT NULL,
    message   TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// PostgreSQL-backed storage over a connection pool.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        let storage = Self::new(pool);
        storage.ensure_schema().await?;
        Ok(storage)
    }

    /// Apply the bootstrap DDL (idempotent).
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn rule_from_row(row: &PgRow) -> Result<TrackingRule> {
    let operation: String = row.try_get("operation")?;
    let priority: String = row.try_get("priority")?;
    let category: String = row.try_get("category")?;
    let tracked_fields: serde_json::Value = row.try_get("tracked_fields")?;
    let subscribers: serde_json::Value = row.try_get("subscribers")?;

    Ok(TrackingRule {
        id:             row.try_get("id")?,
        name:           row.try_get("name")?,
        sequence:       row.try_get("sequence")?,
        active:         row.try_get("active")?,
        model:          row.try_get("model")?,
        operation:      operation.parse()?,
        filter:         row.try_get("filter")?,
        tracked_fields: serde_json::from_value(tracked_fields)?,
        subscribers:    serde_json::from_value(subscribers)?,
        template:       row.try_get("template")?,
        priority:       priority.parse()?,
        category:       category.parse()?,
        instant_send:   row.try_get("instant_send")?,
        rate_limit:     row.try_get::<i32, _>("rate_limit")? as u32,
        debounce_secs:  row.try_get::<i64, _>("debounce_secs")? as u64,
        test_mode:      row.try_get("test_mode")?,
        last_trigger:   row.try_get("last_trigger")?,
        description:    row.try_get("description")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber> {
    let auth: serde_json::Value = row.try_get("auth")?;
    let auth: AuthKind = serde_json::from_value(auth)?;
    let custom_headers: serde_json::Value = row.try_get("custom_headers")?;

    Ok(Subscriber {
        id:               row.try_get("id")?,
        name:             row.try_get("name")?,
        endpoint_url:     row.try_get("endpoint_url")?,
        auth,
        timeout_secs:     row.try_get::<i64, _>("timeout_secs")? as u64,
        verify_tls:       row.try_get("verify_tls")?,
        rate_limit:       row.try_get::<i32, _>("rate_limit")? as u32,
        rate_window_secs: row.try_get::<i64, _>("rate_window_secs")? as u64,
        custom_headers:   serde_json::from_value(custom_headers)?,
        enabled:          row.try_get("enabled")?,
        max_retries:      row.try_get::<i32, _>("max_retries")? as u32,
        last_success_at:  row.try_get("last_success_at")?,
        last_failure_at:  row.try_get("last_failure_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<EventLogEntry> {
    let op: String = row.try_get("op")?;
    let priority: String = row.try_get("priority")?;
    let category: String = row.try_get("category")?;

    Ok(EventLogEntry {
        id:           row.try_get("id")?,
        model:        row.try_get("model")?,
        record_id:    row.try_get("record_id")?,
        op:           op.parse()?,
        payload:      row.try_get("payload")?,
        priority:     priority.parse()?,
        category:     category.parse()?,
        timestamp:    row.try_get("timestamp")?,
        user_id:      row.try_get("user_id")?,
        rule_id:      row.try_get("rule_id")?,
        is_processed: row.try_get("is_processed")?,
        processed_at: row.try_get("processed_at")?,
        is_archived:  row.try_get("is_archived")?,
        archived_at:  row.try_get("archived_at")?,
    })
}

fn dispatch_from_row(row: &PgRow) -> Result<DispatchRecord> {
    let op: String = row.try_get("op")?;
    let priority: String = row.try_get("priority")?;
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    let changed_fields: serde_json::Value = row.try_get("changed_fields")?;

    let error_kind: Option<String> = row.try_get("error_kind")?;
    let last_error = match error_kind {
        Some(kind) => Some(DispatchFailure {
            kind:    kind.parse()?,
            code:    row.try_get::<Option<i32>, _>("error_code")?.map(|c| c as u16),
            message: row.try_get::<Option<String>, _>("error_message")?.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(DispatchRecord {
        id: row.try_get("id")?,
        event_log_id: row.try_get("event_log_id")?,
        model: row.try_get("model")?,
        record_id: row.try_get("record_id")?,
        op: op.parse()?,
        subscriber_id: row.try_get("subscriber_id")?,
        payload: row.try_get("payload")?,
        changed_fields: serde_json::from_value(changed_fields)?,
        priority: priority.parse()?,
        category: category.parse()?,
        status: status.parse()?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error,
        timestamp: row.try_get("timestamp")?,
        started_at: row.try_get("started_at")?,
        sent_at: row.try_get("sent_at")?,
        response_code: row.try_get::<Option<i32>, _>("response_code")?.map(|c| c as u16),
        processing_ms: row.try_get("processing_ms")?,
        template: row.try_get("template")?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetter> {
    let resolution: String = row.try_get("resolution")?;
    let resolution = match resolution.as_str() {
        "pending" => Resolution::Pending,
        "retrying" => Resolution::Retrying,
        "resolved" => Resolution::Resolved,
        "ignored" => Resolution::Ignored,
        other => {
            return Err(PipelineError::SerializationError(format!(
                "unknown resolution '{other}'"
            )));
        },
    };

    Ok(DeadLetter {
        id: row.try_get("id")?,
        dispatch_id: row.try_get("dispatch_id")?,
        failed_at: row.try_get("failed_at")?,
        retry_attempts: row.try_get::<i32, _>("retry_attempts")? as u32,
        original_error: row.try_get("original_error")?,
        resolution,
        resolver: row.try_get("resolver")?,
        resolved_at: row.try_get("resolved_at")?,
        notes: row.try_get("notes")?,
    })
}

fn sync_state_from_row(row: &PgRow) -> Result<SyncState> {
    Ok(SyncState {
        id:                  row.try_get("id")?,
        user_id:             row.try_get("user_id")?,
        device_id:           row.try_get("device_id")?,
        app_type:            row.try_get("app_type")?,
        last_event_id:       row.try_get("last_event_id")?,
        last_sync_time:      row.try_get("last_sync_time")?,
        sync_count:          row.try_get::<i64, _>("sync_count")? as u64,
        last_event_count:    row.try_get::<i64, _>("last_event_count")? as u64,
        total_events_synced: row.try_get::<i64, _>("total_events_synced")? as u64,
        active:              row.try_get("active")?,
    })
}

fn audit_action_from_str(action: &str) -> Result<AuditAction> {
    match action {
        "created" => Ok(AuditAction::Created),
        "sent" => Ok(AuditAction::Sent),
        "failed" => Ok(AuditAction::Failed),
        "retried" => Ok(AuditAction::Retried),
        "archived" => Ok(AuditAction::Archived),
        "deleted" => Ok(AuditAction::Deleted),
        "status_changed" => Ok(AuditAction::StatusChanged),
        other => Err(PipelineError::SerializationError(format!(
            "unknown audit action '{other}'"
        ))),
    }
}

#[async_trait]
impl RuleStore for PostgresStorage {
    async fn insert_rule(&self, rule: TrackingRule) -> Result<TrackingRule> {
        let row = sqlx::query(
            r"INSERT INTO relais_rules
              (name, sequence, active, model, operation, filter, tracked_fields, subscribers,
               template, priority, category, instant_send, rate_limit, debounce_secs, test_mode,
               last_trigger, description)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
              RETURNING *",
        )
        .bind(&rule.name)
        .bind(rule.sequence)
        .bind(rule.active)
        .bind(&rule.model)
        .bind(rule.operation.as_str())
        .bind(&rule.filter)
        .bind(serde_json::to_value(&rule.tracked_fields)?)
        .bind(serde_json::to_value(&rule.subscribers)?)
        .bind(&rule.template)
        .bind(rule.priority.as_str())
        .bind(rule.category.as_str())
        .bind(rule.instant_send)
        .bind(rule.rate_limit as i32)
        .bind(rule.debounce_secs as i64)
        .bind(rule.test_mode)
        .bind(rule.last_trigger)
        .bind(&rule.description)
        .fetch_one(&self.pool)
        .await?;
        rule_from_row(&row)
    }

    async fn update_rule(&self, rule: &TrackingRule) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE relais_rules SET
              name = $2, sequence = $3, active = $4, model = $5, operation = $6, filter = $7,
              tracked_fields = $8, subscribers = $9, template = $10, priority = $11,
              category = $12, instant_send = $13, rate_limit = $14, debounce_secs = $15,
              test_mode = $16, description = $17
              WHERE id = $1",
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.sequence)
        .bind(rule.active)
        .bind(&rule.model)
        .bind(rule.operation.as_str())
        .bind(&rule.filter)
        .bind(serde_json::to_value(&rule.tracked_fields)?)
        .bind(serde_json::to_value(&rule.subscribers)?)
        .bind(&rule.template)
        .bind(rule.priority.as_str())
        .bind(rule.category.as_str())
        .bind(rule.instant_send)
        .bind(rule.rate_limit as i32)
        .bind(rule.debounce_secs as i64)
        .bind(rule.test_mode)
        .bind(&rule.description)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::StorageError {
                reason: format!("rule {} not found", rule.id),
            });
        }
        Ok(())
    }

    async fn delete_rule(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM relais_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_rule(&self, id: i64) -> Result<Option<TrackingRule>> {
        let row = sqlx::query("SELECT * FROM relais_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn active_rules(&self) -> Result<Vec<TrackingRule>> {
        let rows = sqlx::query("SELECT * FROM relais_rules WHERE active ORDER BY sequence, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn touch_rule_trigger(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE relais_rules SET last_trigger = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for PostgresStorage {
    async fn insert_subscriber(&self, subscriber: Subscriber) -> Result<Subscriber> {
        subscriber.validate()?;
        let row = sqlx::query(
            r"INSERT INTO relais_subscribers
              (name, endpoint_url, auth, timeout_secs, verify_tls, rate_limit, rate_window_secs,
               custom_headers, enabled, max_retries)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
              RETURNING *",
        )
        .bind(&subscriber.name)
        .bind(&subscriber.endpoint_url)
        .bind(serde_json::to_value(&subscriber.auth)?)
        .bind(subscriber.timeout_secs as i64)
        .bind(subscriber.verify_tls)
        .bind(subscriber.rate_limit as i32)
        .bind(subscriber.rate_window_secs as i64)
        .bind(serde_json::to_value(&subscriber.custom_headers)?)
        .bind(subscriber.enabled)
        .bind(subscriber.max_retries as i32)
        .fetch_one(&self.pool)
        .await?;
        subscriber_from_row(&row)
    }

    async fn update_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        subscriber.validate()?;
        let result = sqlx::query(
            r"UPDATE relais_subscribers SET
              name = $2, endpoint_url = $3, auth = $4, timeout_secs = $5, verify_tls = $6,
              rate_limit = $7, rate_window_secs = $8, custom_headers = $9, enabled = $10,
              max_retries = $11
              WHERE id = $1",
        )
        .bind(subscriber.id)
        .bind(&subscriber.name)
        .bind(&subscriber.endpoint_url)
        .bind(serde_json::to_value(&subscriber.auth)?)
        .bind(subscriber.timeout_secs as i64)
        .bind(subscriber.verify_tls)
        .bind(subscriber.rate_limit as i32)
        .bind(subscriber.rate_window_secs as i64)
        .bind(serde_json::to_value(&subscriber.custom_headers)?)
        .bind(subscriber.enabled)
        .bind(subscriber.max_retries as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::StorageError {
                reason: format!("subscriber {} not found", subscriber.id),
            });
        }
        Ok(())
    }

    async fn get_subscriber(&self, id: i64) -> Result<Option<Subscriber>> {
        let row = sqlx::query("SELECT * FROM relais_subscribers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    async fn get_subscribers(&self, ids: &[i64]) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query("SELECT * FROM relais_subscribers WHERE id = ANY($1) ORDER BY id")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn record_subscriber_outcome(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = if success {
            "UPDATE relais_subscribers SET last_success_at = $2 WHERE id = $1"
        } else {
            "UPDATE relais_subscribers SET last_failure_at = $2 WHERE id = $1"
        };
        sqlx::query(query).bind(id).bind(at).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventLogStore for PostgresStorage {
    async fn append_event(&self, event: NewEvent) -> Result<AppendOutcome> {
        if event.record_id == 0 {
            return Err(PipelineError::AppendRejected {
                reason: "record_id 0 is forbidden (negative ids mark synthetic events)"
                    .to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        // Row locks serialize supersession per (model, record_id).
        let existing = sqlx::query(
            r"SELECT id, op, is_archived FROM relais_event_log
              WHERE model = $1 AND record_id = $2
              ORDER BY id FOR UPDATE",
        )
        .bind(&event.model)
        .bind(event.record_id)
        .fetch_all(&mut *tx)
        .await?;

        if event.op == EventOp::Write {
            let latest_create = existing
                .iter()
                .filter(|row| {
                    row.get::<String, _>("op") == "create" && !row.get::<bool, _>("is_archived")
                })
                .map(|row| row.get::<i64, _>("id"))
                .max();
            if let Some(create_id) = latest_create {
                let unlinked_since = existing.iter().any(|row| {
                    row.get::<String, _>("op") == "unlink" && row.get::<i64, _>("id") > create_id
                });
                if !unlinked_since {
                    tx.commit().await?;
                    return Ok(AppendOutcome::AbsorbedByCreate);
                }
            }
        }

        let superseded_writes = if event.op == EventOp::Create {
            let result = sqlx::query(
                "DELETE FROM relais_event_log WHERE model = $1 AND record_id = $2 AND op = 'write'",
            )
            .bind(&event.model)
            .bind(event.record_id)
            .execute(&mut *tx)
            .await?;
            result.rows_affected() as usize
        } else {
            0
        };

        let row = sqlx::query(
            r"INSERT INTO relais_event_log
              (model, record_id, op, payload, priority, category, user_id, rule_id)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
              RETURNING id",
        )
        .bind(&event.model)
        .bind(event.record_id)
        .bind(event.op.as_str())
        .bind(&event.payload)
        .bind(event.priority.as_str())
        .bind(event.category.as_str())
        .bind(event.user_id)
        .bind(event.rule_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppendOutcome::Appended {
            id: row.get("id"),
            superseded_writes,
        })
    }

    async fn pull_events(&self, query: &PullQuery) -> Result<PullBatch> {
        let mut sql = String::from(
            r"SELECT * FROM relais_event_log
              WHERE id > $1 AND NOT is_processed AND NOT is_archived",
        );
        if query.models.is_some() {
            sql.push_str(" AND model = ANY($2)");
        }
        if query.priority.is_some() {
            let index = if query.models.is_some() { 3 } else { 2 };
            sql.push_str(&format!(" AND priority = ${index}"));
        }
        // Fetch one extra row to learn has_more without a second query.
        sql.push_str(&format!(" ORDER BY id ASC LIMIT {}", query.limit + 1));

        let mut q = sqlx::query(&sql).bind(query.last_event_id);
        if let Some(models) = &query.models {
            q = q.bind(models);
        }
        if let Some(priority) = query.priority {
            q = q.bind(priority.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut events: Vec<EventLogEntry> =
            rows.iter().map(event_from_row).collect::<Result<_>>()?;

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
        let matched: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM relais_event_log WHERE id = ANY($1)")
                .bind(ids)
                .fetch_one(&self.pool)
                .await?;
        sqlx::query(
            r"UPDATE relais_event_log
              SET is_processed = TRUE, processed_at = NOW()
              WHERE id = ANY($1) AND NOT is_processed",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(matched as u64)
    }

    async fn pending_events(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM relais_event_log WHERE NOT is_processed AND NOT is_archived",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE relais_event_log
              SET is_archived = TRUE, archived_at = NOW()
              WHERE is_processed AND NOT is_archived AND timestamp < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_archived_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM relais_event_log WHERE is_archived AND timestamp < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn log_stats(&self, since: DateTime<Utc>, period_days: u32) -> Result<LogStats> {
        let row = sqlx::query(
            r"SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE is_processed) AS processed,
                COUNT(*) FILTER (WHERE NOT is_processed AND NOT is_archived) AS pending,
                COUNT(*) FILTER (WHERE is_archived) AS archived
              FROM relais_event_log WHERE timestamp >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let by_model_rows = sqlx::query(
            r"SELECT model, COUNT(*) AS count FROM relais_event_log
              WHERE timestamp >= $1
              GROUP BY model ORDER BY count DESC, model LIMIT 10",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let by_priority_rows = sqlx::query(
            r"SELECT priority, COUNT(*) AS count FROM relais_event_log
              WHERE timestamp >= $1 GROUP BY priority",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(LogStats {
            period_days,
            total: row.get::<i64, _>("total") as u64,
            processed: row.get::<i64, _>("processed") as u64,
            pending: row.get::<i64, _>("pending") as u64,
            archived: row.get::<i64, _>("archived") as u64,
            by_model: by_model_rows
                .iter()
                .map(|r| ModelCount {
                    model: r.get("model"),
                    count: r.get::<i64, _>("count") as u64,
                })
                .collect(),
            by_priority: by_priority_rows
                .iter()
                .map(|r| (r.get::<String, _>("priority"), r.get::<i64, _>("count") as u64))
                .collect(),
        })
    }

    async fn live_record_refs(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT model, record_id FROM relais_event_log WHERE record_id > 0",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| (r.get("model"), r.get("record_id"))).collect())
    }

    async fn delete_events_for_record(&self, model: &str, record_id: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM relais_event_log WHERE model = $1 AND record_id = $2")
                .bind(model)
                .bind(record_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DispatchStore for PostgresStorage {
    async fn enqueue_dispatch(&self, dispatch: NewDispatch) -> Result<DispatchRecord> {
        let row = sqlx::query(
            r"INSERT INTO relais_dispatch
              (event_log_id, model, record_id, op, subscriber_id, payload, changed_fields,
               priority, category, max_retries, template)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
              RETURNING *",
        )
        .bind(dispatch.event_log_id)
        .bind(&dispatch.model)
        .bind(dispatch.record_id)
        .bind(dispatch.op.as_str())
        .bind(dispatch.subscriber_id)
        .bind(&dispatch.payload)
        .bind(serde_json::to_value(&dispatch.changed_fields)?)
        .bind(dispatch.priority.as_str())
        .bind(dispatch.category.as_str())
        .bind(dispatch.max_retries as i32)
        .bind(&dispatch.template)
        .fetch_one(&self.pool)
        .await?;
        dispatch_from_row(&row)
    }

    async fn get_dispatch(&self, id: i64) -> Result<Option<DispatchRecord>> {
        let row = sqlx::query("SELECT * FROM relais_dispatch WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dispatch_from_row).transpose()
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchRecord>> {
        let rows = sqlx::query(
            r"SELECT * FROM relais_dispatch
              WHERE (status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1))
                 OR (status = 'failed' AND next_retry_at <= $1 AND retry_count < max_retries)
              ORDER BY CASE priority WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC,
                       timestamp ASC, id ASC
              LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dispatch_from_row).collect()
    }

    async fn claim_dispatch(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE relais_dispatch
              SET status = 'processing', started_at = $2
              WHERE id = $1 AND status IN ('pending', 'failed')",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(
        &self,
        id: i64,
        at: DateTime<Utc>,
        response_code: u16,
        processing_ms: f64,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE relais_dispatch
              SET status = 'sent', sent_at = $2, response_code = $3, processing_ms = $4,
                  next_retry_at = NULL
              WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .bind(i32::from(response_code))
        .bind(processing_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        failure: &DispatchFailure,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE relais_dispatch
              SET status = 'failed', retry_count = $2, next_retry_at = $3,
                  error_kind = $4, error_code = $5, error_message = $6
              WHERE id = $1",
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(next_retry_at)
        .bind(failure.kind.as_str())
        .bind(failure.code.map(i32::from))
        .bind(&failure.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, id: i64, retry_count: u32, failure: &DispatchFailure) -> Result<()> {
        sqlx::query(
            r"UPDATE relais_dispatch
              SET status = 'dead', retry_count = $2, next_retry_at = NULL,
                  error_kind = $3, error_code = $4, error_message = $5
              WHERE id = $1",
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(failure.kind.as_str())
        .bind(failure.code.map(i32::from))
        .bind(&failure.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn postpone_dispatch(&self, id: i64, until: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE relais_dispatch SET next_retry_at = $2 WHERE id = $1")
            .bind(id)
            .bind(until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE relais_dispatch
              SET status = 'pending', started_at = NULL
              WHERE status = 'processing' AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sent_count_since(&self, subscriber_id: i64, cutoff: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM relais_dispatch
              WHERE subscriber_id = $1 AND status = 'sent' AND sent_at >= $2",
        )
        .bind(subscriber_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl DeadLetterStore for PostgresStorage {
    async fn create_dead_letter(&self, letter: DeadLetter) -> Result<DeadLetter> {
        // ON CONFLICT keeps the first letter: at most one per dispatch.
        sqlx::query(
            r"INSERT INTO relais_dead_letters
              (dispatch_id, failed_at, retry_attempts, original_error, resolution)
              VALUES ($1, $2, $3, $4, 'pending')
              ON CONFLICT (dispatch_id) DO NOTHING",
        )
        .bind(letter.dispatch_id)
        .bind(letter.failed_at)
        .bind(letter.retry_attempts as i32)
        .bind(&letter.original_error)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM relais_dead_letters WHERE dispatch_id = $1")
            .bind(letter.dispatch_id)
            .fetch_one(&self.pool)
            .await?;
        dead_letter_from_row(&row)
    }

    async fn pending_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r"SELECT * FROM relais_dead_letters
              WHERE resolution = 'pending' ORDER BY failed_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolution: Resolution,
        resolver: Option<i64>,
        notes: Option<String>,
    ) -> Result<()> {
        let resolution = match resolution {
            Resolution::Pending => "pending",
            Resolution::Retrying => "retrying",
            Resolution::Resolved => "resolved",
            Resolution::Ignored => "ignored",
        };
        let result = sqlx::query(
            r"UPDATE relais_dead_letters
              SET resolution = $2, resolver = $3, resolved_at = NOW(), notes = $4
              WHERE id = $1",
        )
        .bind(id)
        .bind(resolution)
        .bind(resolver)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::StorageError {
                reason: format!("dead letter {id} not found"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for PostgresStorage {
    async fn get_or_create_sync_state(
        &self,
        user_id: i64,
        device_id: &str,
        app_type: &str,
    ) -> Result<SyncState> {
        let row = sqlx::query(
            r"INSERT INTO relais_sync_state (user_id, device_id, app_type)
              VALUES ($1, $2, $3)
              ON CONFLICT (user_id, device_id)
              DO UPDATE SET app_type = EXCLUDED.app_type
              RETURNING *",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(app_type)
        .fetch_one(&self.pool)
        .await?;
        sync_state_from_row(&row)
    }

    async fn update_sync_state(&self, state: &SyncState) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE relais_sync_state SET
              last_event_id = $2, last_sync_time = $3, sync_count = $4,
              last_event_count = $5, total_events_synced = $6, active = $7
              WHERE id = $1",
        )
        .bind(state.id)
        .bind(state.last_event_id)
        .bind(state.last_sync_time)
        .bind(state.sync_count as i64)
        .bind(state.last_event_count as i64)
        .bind(state.total_events_synced as i64)
        .bind(state.active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::StorageError {
                reason: format!("sync state {} not found", state.id),
            });
        }
        Ok(())
    }

    async fn cleanup_sync_states(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM relais_sync_state WHERE NOT active AND last_sync_time < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditStore for PostgresStorage {
    async fn record_audit(&self, record: AuditRecord) -> Result<()> {
        sqlx::query(
            r"INSERT INTO relais_audit
              (dispatch_id, action, timestamp, user_id, old_values, new_values, note)
              VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.dispatch_id)
        .bind(record.action.as_str())
        .bind(record.timestamp)
        .bind(record.user_id)
        .bind(record.old)
        .bind(record.new)
        .bind(record.note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_for_dispatch(&self, dispatch_id: i64) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM relais_audit WHERE dispatch_id = $1 ORDER BY id")
            .bind(dispatch_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let action: String = row.try_get("action")?;
                Ok(AuditRecord {
                    id:          row.try_get("id")?,
                    dispatch_id: row.try_get("dispatch_id")?,
                    action:      audit_action_from_str(&action)?,
                    timestamp:   row.try_get("timestamp")?,
                    user_id:     row.try_get("user_id")?,
                    old:         row.try_get("old_values")?,
                    new:         row.try_get("new_values")?,
                    note:        row.try_get("note")?,
                })
            })
            .collect()
    }

    async fn cleanup_audit(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM relais_audit WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ErrorSink for PostgresStorage {
    async fn record_error(&self, model: &str, record_id: i64, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO relais_errors (model, record_id, message) VALUES ($1, $2, $3)")
            .bind(model)
            .bind(record_id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>> {
        let rows = sqlx::query("SELECT * FROM relais_errors ORDER BY id DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ErrorRecord {
                    id:        row.try_get("id")?,
                    model:     row.try_get("model")?,
                    record_id: row.try_get("record_id")?,
                    message:   row.try_get("message")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    #[ignore = "Requires PostgreSQL connection"]
    async fn test_postgres_round_trip() {
        // Covered by integration environments with a live database; the
        // in-memory backend carries the semantic test load.
    }
}
