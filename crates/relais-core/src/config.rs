//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the event pipeline.
///
/// Every field has a serde default so partial TOML/JSON configs work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Debounce window for repeated mutations of one record (default: 3s)
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Base retry delay; attempt n waits `base * 2^(n-1)` (default: 60s)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Retry budget for new dispatch records (default: 5)
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Whether 4xx responses are retried; when false they dead-letter
    /// immediately (default: true)
    #[serde(default = "default_true")]
    pub retry_client_errors: bool,

    /// Records examined per dispatcher pass (default: 100)
    #[serde(default = "default_dispatch_batch")]
    pub dispatch_batch_size: usize,

    /// Concurrent deliveries per dispatcher pass (default: 8)
    #[serde(default = "default_pool_size")]
    pub dispatcher_pool_size: usize,

    /// Delay applied to rate-limited records before re-examination
    /// (default: 30s)
    #[serde(default = "default_rate_postpone")]
    pub rate_postpone_secs: u64,

    /// `processing` records older than this are reclaimed to `pending`
    /// (default: 600s)
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,

    /// Archive processed events after this many days (default: 7)
    #[serde(default = "default_archive_days")]
    pub archive_after_days: u32,

    /// Delete archived events after this many days (default: 30)
    #[serde(default = "default_delete_days")]
    pub delete_after_days: u32,

    /// Delete audit lines after this many days (default: 180)
    #[serde(default = "default_audit_ttl")]
    pub audit_ttl_days: u32,

    /// Delete inactive sync cursors after this many days (default: 90)
    #[serde(default = "default_sync_ttl")]
    pub sync_state_ttl_days: u32,

    /// Grace period for draining in-flight deliveries at shutdown
    /// (default: 30s)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Retry sweep interval (default: 60s)
    #[serde(default = "default_retry_sweep")]
    pub retry_sweep_secs: u64,

    /// Archive/delete sweep interval (default: 3600s)
    #[serde(default = "default_log_sweep")]
    pub log_sweep_secs: u64,

    /// Audit cleanup interval (default: 86400s)
    #[serde(default = "default_daily_sweep")]
    pub audit_sweep_secs: u64,

    /// Orphan cleanup interval (default: 86400s)
    #[serde(default = "default_daily_sweep")]
    pub orphan_sweep_secs: u64,

    /// Sync-state cleanup interval (default: 604800s)
    #[serde(default = "default_weekly_sweep")]
    pub sync_sweep_secs: u64,
}

const fn default_debounce_secs() -> u64 {
    3
}

const fn default_retry_base_delay() -> u64 {
    60
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_true() -> bool {
    true
}

const fn default_dispatch_batch() -> usize {
    100
}

const fn default_pool_size() -> usize {
    8
}

const fn default_rate_postpone() -> u64 {
    30
}

const fn default_stuck_threshold() -> u64 {
    600
}

const fn default_archive_days() -> u32 {
    7
}

const fn default_delete_days() -> u32 {
    30
}

const fn default_audit_ttl() -> u32 {
    180
}

const fn default_sync_ttl() -> u32 {
    90
}

const fn default_shutdown_grace() -> u64 {
    30
}

const fn default_retry_sweep() -> u64 {
    60
}

const fn default_log_sweep() -> u64 {
    3600
}

const fn default_daily_sweep() -> u64 {
    86_400
}

const fn default_weekly_sweep() -> u64 {
    604_800
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_secs:         default_debounce_secs(),
            retry_base_delay_secs: default_retry_base_delay(),
            default_max_retries:   default_max_retries(),
            retry_client_errors:   default_true(),
            dispatch_batch_size:   default_dispatch_batch(),
            dispatcher_pool_size:  default_pool_size(),
            rate_postpone_secs:    default_rate_postpone(),
            stuck_threshold_secs:  default_stuck_threshold(),
            archive_after_days:    default_archive_days(),
            delete_after_days:     default_delete_days(),
            audit_ttl_days:        default_audit_ttl(),
            sync_state_ttl_days:   default_sync_ttl(),
            shutdown_grace_secs:   default_shutdown_grace(),
            retry_sweep_secs:      default_retry_sweep(),
            log_sweep_secs:        default_log_sweep(),
            audit_sweep_secs:      default_daily_sweep(),
            orphan_sweep_secs:     default_daily_sweep(),
            sync_sweep_secs:       default_weekly_sweep(),
        }
    }
}
