//! Periodic maintenance workers.
//!
//! Each sweep is an idempotent function callable directly (and therefore
//! testable without timers); `spawn_workers` wires them to tokio intervals.
//! A named in-process lock per sweep keeps a single writer even if a sweep
//! overruns its interval.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{
    engine::Engine,
    error::Result,
    store::{AuditStore, DispatchStore, EventLogStore, SyncStateStore},
};

/// Named single-writer locks for the sweeps.
#[derive(Debug, Default)]
pub struct SweepLocks {
    held: DashMap<&'static str, ()>,
}

/// Releases the named lock on drop.
pub struct SweepGuard<'a> {
    locks: &'a SweepLocks,
    name:  &'static str,
}

impl SweepLocks {
    /// Create an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the named lock; `None` when another sweep of the same
    /// name is still running.
    #[must_use]
    pub fn try_acquire(&self, name: &'static str) -> Option<SweepGuard<'_>> {
        match self.held.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Some(SweepGuard { locks: self, name })
            },
        }
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.remove(self.name);
    }
}

/// Result of the retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweepSummary {
    /// `processing` records reclaimed to `pending`
    pub reclaimed: u64,
    /// Records delivered in this pass
    pub sent:      usize,
    /// Records promoted to dead letters in this pass
    pub dead:      usize,
}

/// Retry sweep: reclaim stuck `processing` records, then run one dispatch
/// pass.
pub async fn run_retry_sweep(engine: &Engine) -> Result<RetrySweepSummary> {
    let Some(_guard) = engine.sweep_locks.try_acquire("retry") else {
        debug!("retry sweep already running, skipping");
        return Ok(RetrySweepSummary::default());
    };

    let stuck_cutoff =
        Utc::now() - ChronoDuration::seconds(engine.config.stuck_threshold_secs.min(i64::MAX as u64) as i64);
    let reclaimed = engine.storage.reclaim_stuck(stuck_cutoff).await?;
    if reclaimed > 0 {
        info!(reclaimed, "reclaimed stuck dispatch records");
    }

    let summary = engine.dispatcher.run_once().await?;
    Ok(RetrySweepSummary {
        reclaimed,
        sent: summary.sent,
        dead: summary.dead,
    })
}

/// Archive-and-delete sweep over the event log.
pub async fn run_log_sweep(engine: &Engine) -> Result<(u64, u64)> {
    let Some(_guard) = engine.sweep_locks.try_acquire("log") else {
        return Ok((0, 0));
    };

    let now = Utc::now();
    let archive_cutoff = now - ChronoDuration::days(i64::from(engine.config.archive_after_days));
    let delete_cutoff = now - ChronoDuration::days(i64::from(engine.config.delete_after_days));

    let archived = engine.storage.archive_older_than(archive_cutoff).await?;
    let deleted = engine.storage.delete_archived_older_than(delete_cutoff).await?;

    if archived > 0 || deleted > 0 {
        info!(archived, deleted, "event log sweep complete");
    }
    Ok((archived, deleted))
}

/// Audit-trail TTL cleanup.
pub async fn run_audit_sweep(engine: &Engine) -> Result<u64> {
    let Some(_guard) = engine.sweep_locks.try_acquire("audit") else {
        return Ok(0);
    };

    let cutoff = Utc::now() - ChronoDuration::days(i64::from(engine.config.audit_ttl_days));
    let deleted = engine.storage.cleanup_audit(cutoff).await?;
    if deleted > 0 {
        info!(deleted, "audit cleanup complete");
    }
    Ok(deleted)
}

/// Orphan cleanup: drop log rows whose record no longer exists in the
/// host. Requires an entity catalog (existence probe); a no-op without one.
pub async fn run_orphan_sweep(engine: &Engine) -> Result<u64> {
    let Some(catalog) = engine.catalog.as_ref() else {
        return Ok(0);
    };
    let Some(_guard) = engine.sweep_locks.try_acquire("orphan") else {
        return Ok(0);
    };

    let mut removed = 0;
    for (model, record_id) in engine.storage.live_record_refs().await? {
        if !catalog.exists(&model, record_id) {
            removed += engine.storage.delete_events_for_record(&model, record_id).await?;
        }
    }
    if removed > 0 {
        info!(removed, "orphaned event rows removed");
    }
    Ok(removed)
}

/// Sync-state TTL cleanup.
pub async fn run_sync_sweep(engine: &Engine) -> Result<u64> {
    let Some(_guard) = engine.sweep_locks.try_acquire("sync") else {
        return Ok(0);
    };

    let cutoff = Utc::now() - ChronoDuration::days(i64::from(engine.config.sync_state_ttl_days));
    let deleted = engine.storage.cleanup_sync_states(cutoff).await?;
    if deleted > 0 {
        info!(deleted, "stale sync cursors removed");
    }
    Ok(deleted)
}

/// Spawn all periodic workers; each runs until the engine's shutdown token
/// fires. Sweep errors are logged and never stop a worker.
pub(crate) fn spawn_workers(engine: Arc<Engine>) -> Vec<JoinHandle<()>> {
    let intervals: [(&'static str, u64); 5] = [
        ("retry", engine.config.retry_sweep_secs),
        ("log", engine.config.log_sweep_secs),
        ("audit", engine.config.audit_sweep_secs),
        ("orphan", engine.config.orphan_sweep_secs),
        ("sync", engine.config.sync_sweep_secs),
    ];

    intervals
        .into_iter()
        .map(|(name, secs)| {
            let engine = Arc::clone(&engine);
            let token = engine.shutdown_token();
            tokio::spawn(async move {
                let period = std::time::Duration::from_secs(secs.max(1));
                let mut interval = tokio::time::interval(period);
                // The immediate first tick would race engine startup.
                interval.tick().await;

                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = interval.tick() => {
                            let result = match name {
                                "retry" => run_retry_sweep(&engine).await.map(|_| ()),
                                "log" => run_log_sweep(&engine).await.map(|_| ()),
                                "audit" => run_audit_sweep(&engine).await.map(|_| ()),
                                "orphan" => run_orphan_sweep(&engine).await.map(|_| ()),
                                "sync" => run_sync_sweep(&engine).await.map(|_| ()),
                                _ => Ok(()),
                            };
                            if let Err(e) = result {
                                error!(worker = name, error = %e, "maintenance sweep failed");
                            }
                        },
                    }
                }
                debug!(worker = name, "maintenance worker stopped");
            })
        })
        .collect()
}
