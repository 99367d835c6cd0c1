use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters kept by a dispatcher.
#[derive(Debug)]
pub struct DispatcherStats {
    started_at: DateTime<Utc>,
    commands_processed: AtomicU64,
    commands_failed: AtomicU64,
    commands_rejected: AtomicU64,
    events_handled: AtomicU64,
    events_ignored: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    /// Commands whose handler succeeded.
    pub commands_processed: u64,
    /// Commands whose handler returned an error or panicked.
    pub commands_failed: u64,
    /// Malformed or unknown commands that never reached a handler.
    pub commands_rejected: u64,
    pub events_handled: u64,
    pub events_ignored: u64,
}

impl Default for DispatcherStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            commands_processed: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            events_handled: AtomicU64::new(0),
            events_ignored: AtomicU64::new(0),
        }
    }
}

impl DispatcherStats {
    pub(crate) fn record_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_handled(&self) {
        self.events_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            events_handled: self.events_handled.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
        }
    }
}
