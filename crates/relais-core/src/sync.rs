//! Per-consumer pull cursors.
//!
//! Each `(user, device)` pair keeps its own cursor into the event log so
//! multiple consumer apps can sync incrementally and independently. Cursors
//! are created on first sync and advanced on each acknowledgement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One consumer's sync cursor, unique per `(user_id, device_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Sync-state id (assigned by storage)
    pub id:                  i64,
    /// Owning user
    pub user_id:             i64,
    /// Device identifier (UUID, IMEI, ...)
    pub device_id:           String,
    /// Consumer application kind (free-form, e.g. "mobile_app")
    pub app_type:            String,
    /// Last acknowledged event id
    pub last_event_id:       i64,
    /// Last successful sync
    pub last_sync_time:      Option<DateTime<Utc>>,
    /// Number of sync operations performed
    pub sync_count:          u64,
    /// Events received in the last sync
    pub last_event_count:    u64,
    /// Events synced over the cursor's lifetime
    pub total_events_synced: u64,
    /// Inactive cursors are eligible for TTL cleanup
    pub active:              bool,
}

impl SyncState {
    /// A fresh cursor at the start of the log.
    #[must_use]
    pub fn new(user_id: i64, device_id: impl Into<String>, app_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id,
            device_id: device_id.into(),
            app_type: app_type.into(),
            last_event_id: 0,
            last_sync_time: None,
            sync_count: 0,
            last_event_count: 0,
            total_events_synced: 0,
            active: true,
        }
    }

    /// Advance the cursor after a successful acknowledgement.
    pub fn record_sync(&mut self, last_event_id: i64, event_count: u64) {
        self.last_event_id = last_event_id;
        self.last_sync_time = Some(Utc::now());
        self.sync_count += 1;
        self.last_event_count = event_count;
        self.total_events_synced += event_count;
    }

    /// Reset the cursor to force a full re-sync.
    pub fn reset(&mut self) {
        self.last_event_id = 0;
        self.sync_count = 0;
        self.last_event_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sync_advances_counters() {
        let mut state = SyncState::new(7, "device-a", "mobile_app");
        state.record_sync(120, 40);
        state.record_sync(180, 60);

        assert_eq!(state.last_event_id, 180);
        assert_eq!(state.sync_count, 2);
        assert_eq!(state.last_event_count, 60);
        assert_eq!(state.total_events_synced, 100);
        assert!(state.last_sync_time.is_some());
    }

    #[test]
    fn test_reset_preserves_lifetime_total() {
        let mut state = SyncState::new(7, "device-a", "mobile_app");
        state.record_sync(120, 40);
        state.reset();

        assert_eq!(state.last_event_id, 0);
        assert_eq!(state.sync_count, 0);
        assert_eq!(state.total_events_synced, 40);
    }
}
