//! Tracking rules and the process-wide rule registry cache.
//!
//! A [`TrackingRule`] binds a `(model, operation)` pair to tracking settings
//! and subscribers. The [`RuleRegistry`] answers the two hot-path questions
//! without storage access in the common case: *is this model tracked?* and
//! *which rules apply to `(model, op)`?* It is backed by an atomically
//! swapped snapshot that is rebuilt on demand after invalidation.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    entity::EntityCatalog,
    error::{PipelineError, Result},
    event::{Category, EventOp, Priority},
    filter::FilterParser,
    store::RuleStore,
};

/// Model-name prefixes never tracked (host-internal/technical models).
pub const RESERVED_MODEL_PREFIXES: &[&str] = &["system.", "webhook."];

/// Declarative tracking policy for one `(model, operation)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRule {
    /// Rule id (assigned by storage)
    pub id:             i64,
    /// Descriptive name
    pub name:           String,
    /// Ordering among rules for the same key (lower fires first)
    pub sequence:       i32,
    /// Inactive rules are invisible to the registry
    pub active:         bool,
    /// Technical model name this rule tracks
    pub model:          String,
    /// Tracked operation
    pub operation:      EventOp,
    /// Optional record filter (DSL source, validated at save time)
    pub filter:         Option<String>,
    /// Field restriction; empty means all fields. For writes, the event only
    /// fires when a tracked field actually changed.
    pub tracked_fields: Vec<String>,
    /// Subscriber ids to notify
    pub subscribers:    Vec<i64>,
    /// Optional payload template source
    pub template:       Option<String>,
    /// Event priority
    pub priority:       Priority,
    /// Event category
    pub category:       Category,
    /// Attempt delivery synchronously after commit (high priority only)
    pub instant_send:   bool,
    /// Max events per minute, 0 = unlimited (bookkeeping; enforcement is
    /// per-subscriber at dispatch time)
    pub rate_limit:     u32,
    /// Per-rule debounce window override in seconds, 0 = engine default
    pub debounce_secs:  u64,
    /// Log events without dispatching to subscribers
    pub test_mode:      bool,
    /// When this rule last fired
    pub last_trigger:   Option<DateTime<Utc>>,
    /// Operator notes
    pub description:    Option<String>,
}

impl TrackingRule {
    /// A minimal active rule for `(model, operation)`.
    #[must_use]
    pub fn new(model: impl Into<String>, operation: EventOp) -> Self {
        let model = model.into();
        Self {
            id: 0,
            name: format!("{model} {}", operation.as_str()),
            sequence: 10,
            active: true,
            model,
            operation,
            filter: None,
            tracked_fields: Vec::new(),
            subscribers: Vec::new(),
            template: None,
            priority: Priority::default(),
            category: Category::default(),
            instant_send: false,
            rate_limit: 0,
            debounce_secs: 0,
            test_mode: false,
            last_trigger: None,
            description: None,
        }
    }

    /// Whether any of `changed` intersects this rule's tracked fields.
    ///
    /// Rules without tracked fields match every change; so does a write with
    /// no reported changed values.
    #[must_use]
    pub fn matches_changed_fields(&self, changed: Option<&[String]>) -> bool {
        if self.tracked_fields.is_empty() {
            return true;
        }
        let Some(changed) = changed else {
            return true;
        };
        if changed.is_empty() {
            return true;
        }
        changed.iter().any(|c| self.tracked_fields.iter().any(|t| t == c))
    }
}

#[derive(Debug, Default)]
struct RuleIndex {
    tracked_models: HashSet<String>,
    by_key:         HashMap<(String, EventOp), Vec<TrackingRule>>,
}

impl RuleIndex {
    fn build(mut rules: Vec<TrackingRule>) -> Self {
        rules.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.id.cmp(&b.id)));

        let mut index = RuleIndex::default();
        for rule in rules {
            index.tracked_models.insert(rule.model.clone());
            index
                .by_key
                .entry((rule.model.clone(), rule.operation))
                .or_default()
                .push(rule);
        }
        index
    }
}

struct CacheState {
    snapshot: Arc<RuleIndex>,
    valid:    bool,
}

/// Process-wide rule cache over a [`RuleStore`].
///
/// Readers use the last published snapshot; after invalidation the next
/// reader rebuilds under an exclusive rebuild lock while concurrent readers
/// keep serving the stale snapshot instead of blocking.
pub struct RuleRegistry {
    store:        Arc<dyn RuleStore>,
    cache:        RwLock<CacheState>,
    rebuild_lock: tokio::sync::Mutex<()>,
    parser:       FilterParser,
}

impl RuleRegistry {
    /// Create a registry over the given rule store. The cache starts
    /// invalid; the first lookup rebuilds it.
    #[must_use]
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(CacheState {
                snapshot: Arc::new(RuleIndex::default()),
                valid:    false,
            }),
            rebuild_lock: tokio::sync::Mutex::new(()),
            parser: FilterParser::new(),
        }
    }

    /// O(1) check whether `model` has any active rule.
    ///
    /// Reserved/internal model names are never tracked.
    pub async fn is_tracked(&self, model: &str) -> bool {
        if RESERVED_MODEL_PREFIXES.iter().any(|p| model.starts_with(p)) {
            return false;
        }
        let index = self.snapshot().await;
        index.tracked_models.contains(model)
    }

    /// Active rules for `(model, op)`, ordered by `(sequence, id)`.
    pub async fn rules_for(&self, model: &str, op: EventOp) -> Vec<TrackingRule> {
        let index = self.snapshot().await;
        index
            .by_key
            .get(&(model.to_string(), op))
            .cloned()
            .unwrap_or_default()
    }

    /// Flip the validity flag; the next read rebuilds.
    pub fn invalidate(&self) {
        self.cache.write().valid = false;
        info!("tracking rule cache invalidated");
    }

    /// Validate and persist a rule, then invalidate the cache.
    ///
    /// Enforces filter syntax, tracked-field existence (when a catalog is
    /// available), and the soft invariant of at most one active rule per
    /// `(model, op)`.
    pub async fn save_rule(
        &self,
        rule: TrackingRule,
        catalog: Option<&dyn EntityCatalog>,
    ) -> Result<TrackingRule> {
        self.validate(&rule, catalog).await?;

        let saved = if rule.id == 0 {
            self.store.insert_rule(rule).await?
        } else {
            self.store.update_rule(&rule).await?;
            rule
        };

        self.invalidate();
        Ok(saved)
    }

    /// Delete a rule and invalidate the cache.
    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        self.store.delete_rule(id).await?;
        self.invalidate();
        Ok(())
    }

    /// Record that a rule fired. Best-effort bookkeeping with no cache
    /// invalidation; the trigger timestamp does not affect matching.
    pub async fn touch_trigger(&self, id: i64) {
        if let Err(e) = self.store.touch_rule_trigger(id, Utc::now()).await {
            debug!(rule_id = id, error = %e, "failed to record rule trigger time");
        }
    }

    async fn validate(&self, rule: &TrackingRule, catalog: Option<&dyn EntityCatalog>) -> Result<()> {
        if rule.model.trim().is_empty() {
            return Err(PipelineError::InvalidRule {
                message: "model name must not be empty".to_string(),
            });
        }

        if RESERVED_MODEL_PREFIXES.iter().any(|p| rule.model.starts_with(p)) {
            return Err(PipelineError::InvalidRule {
                message: format!("model '{}' is reserved and cannot be tracked", rule.model),
            });
        }

        if let Some(filter) = rule.filter.as_deref() {
            self.parser.parse(filter)?;
        }

        if let Some(catalog) = catalog {
            if let Some(fields) = catalog.fields(&rule.model) {
                for tracked in &rule.tracked_fields {
                    if !fields.iter().any(|f| &f.name == tracked) {
                        return Err(PipelineError::InvalidRule {
                            message: format!(
                                "field '{tracked}' does not exist in model {}",
                                rule.model
                            ),
                        });
                    }
                }
            }
        }

        // Soft uniqueness: at most one active rule per (model, op).
        if rule.active {
            let existing = self.store.active_rules().await?;
            let duplicate = existing.iter().any(|r| {
                r.id != rule.id && r.model == rule.model && r.operation == rule.operation
            });
            if duplicate {
                return Err(PipelineError::InvalidRule {
                    message: format!(
                        "an active rule for ({}, {}) already exists",
                        rule.model,
                        rule.operation.as_str()
                    ),
                });
            }
        }

        Ok(())
    }

    /// Current snapshot; rebuilds when invalid, without blocking readers
    /// that can still use the previous snapshot.
    async fn snapshot(&self) -> Arc<RuleIndex> {
        let stale = {
            let state = self.cache.read();
            if state.valid {
                return Arc::clone(&state.snapshot);
            }
            Arc::clone(&state.snapshot)
        };

        // One rebuilder at a time; everyone else serves the stale snapshot.
        let Ok(_guard) = self.rebuild_lock.try_lock() else {
            return stale;
        };

        match self.store.active_rules().await {
            Ok(rules) => {
                let count = rules.len();
                let index = Arc::new(RuleIndex::build(rules));
                {
                    let mut state = self.cache.write();
                    state.snapshot = Arc::clone(&index);
                    state.valid = true;
                }
                info!(
                    models = index.tracked_models.len(),
                    rules = count,
                    "tracking rule cache rebuilt"
                );
                index
            },
            Err(e) => {
                debug!(error = %e, "rule cache rebuild failed, serving stale snapshot");
                stale
            },
        }
    }
}
