//! Persistence traits for the reconciliation engine.
//!
//! Each collection gets its own narrow trait so services depend only on
//! what they touch, and tests can swap any of them independently. The
//! [`memory`] module provides a single in-memory struct implementing all of
//! them.
//!
//! Write disciplines worth calling out:
//!
//! - Aggregates are replaced whole, always under the event mutex.
//! - Summaries are keyed by `(event, PR)` and overwritten on re-fetch.
//! - Defects are keyed upserts by `(task, defect)`; shard assignment is a
//!   pure function of the defect ID, so concurrent page writes never
//!   contend across shards.
//! - Fragments are replaced per task in one atomic swap, so readers never
//!   observe the half-deleted state a delete-then-reinsert would expose.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use codegate_core::id::{EventId, TaskId};

use crate::error::Result;
use crate::model::{
    AggregateEvent, CheckResult, CheckSummary, CheckTask, DefectRecord, FossFragment,
    InnerSnapshot, ProcessingState,
};

/// Aggregate events and inner-track snapshots.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Loads the aggregate record for an event.
    async fn aggregate(&self, event_id: &EventId) -> Result<Option<AggregateEvent>>;

    /// Replaces the aggregate record. Callers hold the event mutex.
    async fn put_aggregate(&self, aggregate: AggregateEvent) -> Result<()>;

    /// Loads the inner track's snapshot for an event.
    async fn inner_snapshot(&self, event_id: &EventId) -> Result<Option<InnerSnapshot>>;

    /// Stores an inner-track snapshot.
    async fn put_inner_snapshot(&self, snapshot: InnerSnapshot) -> Result<()>;

    /// IDs of still-running events with recent activity: an inner snapshot
    /// updated at or after the cutoff, or, without a snapshot, an aggregate
    /// started at or after it.
    async fn running_event_ids_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventId>>;

    /// Writes a terminal outcome straight onto the event record, bypassing
    /// the merge; used when a task goes stale during drain. Unknown events
    /// are left untouched.
    async fn update_event_outcome(
        &self,
        event_id: &EventId,
        outcome: CheckResult,
        end_time: DateTime<Utc>,
    ) -> Result<()>;
}

/// Check tasks and their sync lifecycle.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Loads a task by ID.
    async fn task(&self, task_id: &TaskId) -> Result<Option<CheckTask>>;

    /// Creates or replaces a task.
    async fn put_task(&self, task: CheckTask) -> Result<()>;

    /// Tasks in a pending state, eligible for the drain trigger.
    async fn pending_tasks(&self) -> Result<Vec<CheckTask>>;

    /// Transitions a task's sync lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::TaskNotFound`] for an unknown task.
    async fn set_processing(&self, task_id: &TaskId, state: ProcessingState) -> Result<()>;
}

/// Per-PR check summaries, keyed by `(event, PR)`.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Loads the summary for one PR of an event.
    async fn summary(&self, event_id: &EventId, mr_url: &str) -> Result<Option<CheckSummary>>;

    /// Overwrites the summary for one PR of an event.
    async fn put_summary(&self, summary: CheckSummary) -> Result<()>;

    /// All summaries of an event.
    async fn summaries_for_event(&self, event_id: &EventId) -> Result<Vec<CheckSummary>>;
}

/// Sharded defect records, keyed by `(task, defect)`.
#[async_trait]
pub trait DefectStore: Send + Sync {
    /// Upserts a defect. Repeated delivery of the same page is a no-op.
    async fn upsert(&self, defect: DefectRecord) -> Result<()>;

    /// All defects recorded for a task, across shards.
    async fn defects_for_task(&self, task_id: &TaskId) -> Result<Vec<DefectRecord>>;

    /// Removes every defect of a task; the compensating delete after a page
    /// failure. Returns the number removed.
    async fn remove_for_task(&self, task_id: &TaskId) -> Result<u64>;
}

/// Curated open-source-scan fragments, keyed by issue key.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Loads a fragment by issue key.
    async fn fragment(&self, issue_key: &str) -> Result<Option<FossFragment>>;

    /// All fragments recorded for a task.
    async fn fragments_for_task(&self, task_id: &TaskId) -> Result<Vec<FossFragment>>;

    /// Atomically replaces all fragments of a task with the given set.
    ///
    /// Readers observe either the old set or the new set, never an empty or
    /// mixed window.
    async fn replace_for_task(&self, task_id: &TaskId, fragments: Vec<FossFragment>)
        -> Result<()>;

    /// Removes every fragment of a task. Returns the number removed.
    async fn remove_for_task(&self, task_id: &TaskId) -> Result<u64>;
}
