//! Observability - sync counters and snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters shared by every sync component of one context.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    batches_flushed: AtomicU64,
    updates_applied: AtomicU64,
    updates_dropped: AtomicU64,
    entities_deleted: AtomicU64,
    repairs_applied: AtomicU64,
    switches_applied: AtomicU64,
    switches_stale: AtomicU64,
    switches_skipped: AtomicU64,
    switches_failed: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_batch, batches_flushed);
    counter!(record_applied, updates_applied);
    counter!(record_dropped, updates_dropped);
    counter!(record_deleted, entities_deleted);
    counter!(record_repairs, repairs_applied);
    counter!(record_switch_applied, switches_applied);
    counter!(record_switch_stale, switches_stale);
    counter!(record_switch_skipped, switches_skipped);
    counter!(record_switch_failed, switches_failed);
    counter!(record_request_completed, requests_completed);
    counter!(record_request_failed, requests_failed);

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            batches_flushed: load(&self.batches_flushed),
            updates_applied: load(&self.updates_applied),
            updates_dropped: load(&self.updates_dropped),
            entities_deleted: load(&self.entities_deleted),
            repairs_applied: load(&self.repairs_applied),
            switches_applied: load(&self.switches_applied),
            switches_stale: load(&self.switches_stale),
            switches_skipped: load(&self.switches_skipped),
            switches_failed: load(&self.switches_failed),
            requests_completed: load(&self.requests_completed),
            requests_failed: load(&self.requests_failed),
        }
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_flushed: u64,
    pub updates_applied: u64,
    pub updates_dropped: u64,
    pub entities_deleted: u64,
    pub repairs_applied: u64,
    pub switches_applied: u64,
    pub switches_stale: u64,
    pub switches_skipped: u64,
    pub switches_failed: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
}
