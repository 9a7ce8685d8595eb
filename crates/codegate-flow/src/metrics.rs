//! Observability metrics for the reconciliation engine.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `codegate_events_merged_total` | Counter | `outcome` | Merge passes by outcome |
//! | `codegate_merge_duration_seconds` | Histogram | - | One merge pass under the mutex |
//! | `codegate_tasks_synced_total` | Counter | `outcome` | Detail sync attempts by outcome |
//! | `codegate_sync_duration_seconds` | Histogram | - | One task's full detail sync |
//! | `codegate_defects_upserted_total` | Counter | - | Defect rows upserted |
//! | `codegate_fragments_stored_total` | Counter | - | Foss fragments stored |
//! | `codegate_lock_contention_total` | Counter | - | Acquisitions that gave up busy |
//! | `codegate_poll_cycle_duration_seconds` | Histogram | `trigger` | Whole poll cycle duration |
//!
//! Metrics flow through the `metrics` crate facade; wire an exporter in the
//! service binary to publish them.

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Merge passes by outcome.
    pub const EVENTS_MERGED_TOTAL: &str = "codegate_events_merged_total";
    /// Histogram: One merge pass under the event mutex, in seconds.
    pub const MERGE_DURATION_SECONDS: &str = "codegate_merge_duration_seconds";
    /// Counter: Detail sync attempts by outcome.
    pub const TASKS_SYNCED_TOTAL: &str = "codegate_tasks_synced_total";
    /// Histogram: One task's full detail sync, in seconds.
    pub const SYNC_DURATION_SECONDS: &str = "codegate_sync_duration_seconds";
    /// Counter: Defect rows upserted.
    pub const DEFECTS_UPSERTED_TOTAL: &str = "codegate_defects_upserted_total";
    /// Counter: Foss fragments stored.
    pub const FRAGMENTS_STORED_TOTAL: &str = "codegate_fragments_stored_total";
    /// Counter: Lock acquisitions that exhausted their wait budget.
    pub const LOCK_CONTENTION_TOTAL: &str = "codegate_lock_contention_total";
    /// Histogram: Whole poll cycle duration, in seconds.
    pub const POLL_CYCLE_DURATION_SECONDS: &str = "codegate_poll_cycle_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Merge or sync outcome.
    pub const OUTCOME: &str = "outcome";
    /// Poll trigger (reconcile, drain).
    pub const TRIGGER: &str = "trigger";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a merge pass and its outcome.
    pub fn record_merge(&self, outcome: &str, duration: Duration) {
        counter!(
            names::EVENTS_MERGED_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(names::MERGE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a detail sync attempt and its outcome.
    pub fn record_sync(&self, outcome: &str, duration: Duration) {
        counter!(
            names::TASKS_SYNCED_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(names::SYNC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records upserted defect rows.
    pub fn record_defects_upserted(&self, count: u64) {
        counter!(names::DEFECTS_UPSERTED_TOTAL).increment(count);
    }

    /// Records stored foss fragments.
    pub fn record_fragments_stored(&self, count: u64) {
        counter!(names::FRAGMENTS_STORED_TOTAL).increment(count);
    }

    /// Records a lock acquisition that gave up busy.
    pub fn record_lock_contention(&self) {
        counter!(names::LOCK_CONTENTION_TOTAL).increment(1);
    }

    /// Records a whole poll cycle.
    pub fn observe_poll_cycle(&self, trigger: &str, duration: Duration) {
        histogram!(
            names::POLL_CYCLE_DURATION_SECONDS,
            labels::TRIGGER => trigger.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}
