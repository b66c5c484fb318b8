//! Per-record debouncing of repeated mutations.
//!
//! Hosts often emit several writes for the same record within milliseconds
//! (computed fields, related-field cascades). The debouncer collapses those
//! into a single event per time window. Create and write share one window
//! per record so that the write immediately following a create is absorbed;
//! unlink keeps its own window.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::EventOp;

/// Entries untouched for this long are evicted opportunistically.
const EVICT_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DebounceKey {
    model:     String,
    record_id: i64,
    bucket:    &'static str,
}

#[derive(Debug, Default)]
struct DebounceState {
    last_fire: HashMap<DebounceKey, Instant>,
    stats:     DebounceStats,
}

/// Debounce counters for monitoring.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DebounceStats {
    /// Total invocations checked
    pub total_checked: u64,
    /// Invocations suppressed inside the window
    pub suppressed:    u64,
    /// Invocations that fired
    pub fired:         u64,
}

/// In-process debounce map guarded by a mutex.
#[derive(Debug)]
pub struct Debouncer {
    window:  Duration,
    entries: Mutex<DebounceState>,
}

impl Debouncer {
    /// Create a debouncer with the engine-wide window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(DebounceState::default()),
        }
    }

    /// The engine-wide window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Check whether an event for `(model, record_id, op)` should fire.
    ///
    /// Returns `false` and records a suppression when the previous fire for
    /// the same key is still inside the window. Otherwise records the fire
    /// time and returns `true`. A per-rule override widens (never narrows)
    /// the engine window.
    pub fn should_fire(
        &self,
        model: &str,
        record_id: i64,
        op: EventOp,
        window_override: Option<Duration>,
    ) -> bool {
        let window = window_override.map_or(self.window, |w| w.max(self.window));
        let key = DebounceKey {
            model: model.to_string(),
            record_id,
            bucket: op.debounce_bucket(),
        };
        let now = Instant::now();

        let mut state = self.entries.lock();

        // Opportunistic eviction of stale entries.
        state.last_fire.retain(|_, at| now.duration_since(*at) <= EVICT_AFTER);

        state.stats.total_checked += 1;

        if let Some(last) = state.last_fire.get(&key) {
            if now.duration_since(*last) < window {
                state.stats.suppressed += 1;
                tracing::debug!(
                    model,
                    record_id,
                    bucket = key.bucket,
                    "debounced repeat event"
                );
                return false;
            }
        }

        state.last_fire.insert(key, now);
        state.stats.fired += 1;
        true
    }

    /// Snapshot of the debounce counters.
    #[must_use]
    pub fn stats(&self) -> DebounceStats {
        self.entries.lock().stats
    }

    /// Number of live window entries (after eviction on the last check).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().last_fire.len()
    }

    /// Whether no window entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
