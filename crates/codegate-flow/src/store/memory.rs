//! In-memory implementation of every store trait.
//!
//! One struct backs all five traits so tests can hand the same `Arc` to
//! each seam of the dispatcher. Interior mutability uses `std::sync`
//! locks; hold times are tiny and never span an await point.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use codegate_core::id::{EventId, TaskId};

use crate::error::{Error, Result};
use crate::model::{
    shard_for, AggregateEvent, AggregateStatus, CheckResult, CheckSummary, CheckTask,
    DefectRecord, FossFragment, InnerSnapshot, ProcessingState,
};
use crate::store::{DefectStore, EventStore, FragmentStore, SummaryStore, TaskStore};

const DEFAULT_SHARD_COUNT: u64 = 10;

/// In-memory backing for all store traits.
#[derive(Debug)]
pub struct InMemoryStores {
    aggregates: RwLock<HashMap<EventId, AggregateEvent>>,
    snapshots: RwLock<HashMap<EventId, InnerSnapshot>>,
    tasks: RwLock<HashMap<TaskId, CheckTask>>,
    summaries: RwLock<HashMap<(EventId, String), CheckSummary>>,
    defect_shards: Vec<RwLock<HashMap<(TaskId, String), DefectRecord>>>,
    fragments: RwLock<HashMap<String, FossFragment>>,
}

impl InMemoryStores {
    /// Creates empty stores with the default defect shard count.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shard_count(DEFAULT_SHARD_COUNT)
    }

    /// Creates empty stores with an explicit defect shard count.
    #[must_use]
    pub fn with_shard_count(shard_count: u64) -> Self {
        let shard_count = shard_count.max(1);
        let defect_shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            aggregates: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            summaries: RwLock::new(HashMap::new()),
            defect_shards,
            fragments: RwLock::new(HashMap::new()),
        }
    }

    /// Total defect count across shards; test observability.
    #[must_use]
    pub fn defect_count(&self) -> usize {
        self.defect_shards
            .iter()
            .map(|shard| shard.read().map(|map| map.len()).unwrap_or(0))
            .sum()
    }

    fn shard(&self, defect_id: &str) -> &RwLock<HashMap<(TaskId, String), DefectRecord>> {
        let index = shard_for(defect_id, self.defect_shards.len() as u64);
        let index = usize::try_from(index).unwrap_or(0);
        &self.defect_shards[index]
    }
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

fn poison_err() -> Error {
    Error::storage("in-memory store lock poisoned")
}

#[async_trait]
impl EventStore for InMemoryStores {
    async fn aggregate(&self, event_id: &EventId) -> Result<Option<AggregateEvent>> {
        let aggregates = self.aggregates.read().map_err(|_| poison_err())?;
        Ok(aggregates.get(event_id).cloned())
    }

    async fn put_aggregate(&self, aggregate: AggregateEvent) -> Result<()> {
        let mut aggregates = self.aggregates.write().map_err(|_| poison_err())?;
        aggregates.insert(aggregate.event_id.clone(), aggregate);
        Ok(())
    }

    async fn inner_snapshot(&self, event_id: &EventId) -> Result<Option<InnerSnapshot>> {
        let snapshots = self.snapshots.read().map_err(|_| poison_err())?;
        Ok(snapshots.get(event_id).cloned())
    }

    async fn put_inner_snapshot(&self, snapshot: InnerSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().map_err(|_| poison_err())?;
        snapshots.insert(snapshot.event_id.clone(), snapshot);
        Ok(())
    }

    async fn running_event_ids_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventId>> {
        let aggregates = self.aggregates.read().map_err(|_| poison_err())?;
        let snapshots = self.snapshots.read().map_err(|_| poison_err())?;
        let mut ids: Vec<EventId> = aggregates
            .values()
            .filter(|aggregate| {
                if aggregate.is_done() {
                    return false;
                }
                snapshots
                    .get(&aggregate.event_id)
                    .map_or(aggregate.start_time >= cutoff, |snapshot| {
                        snapshot.updated_at >= cutoff
                    })
            })
            .map(|aggregate| aggregate.event_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn update_event_outcome(
        &self,
        event_id: &EventId,
        outcome: CheckResult,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut aggregates = self.aggregates.write().map_err(|_| poison_err())?;
        if let Some(aggregate) = aggregates.get_mut(event_id) {
            aggregate.total_result = Some(outcome);
            aggregate.current_status = AggregateStatus::Done;
            aggregate.end_time = Some(end_time);
            aggregate.duration_minutes = Some((end_time - aggregate.start_time).num_minutes());
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStores {
    async fn task(&self, task_id: &TaskId) -> Result<Option<CheckTask>> {
        let tasks = self.tasks.read().map_err(|_| poison_err())?;
        Ok(tasks.get(task_id).cloned())
    }

    async fn put_task(&self, task: CheckTask) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(|_| poison_err())?;
        tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn pending_tasks(&self) -> Result<Vec<CheckTask>> {
        let tasks = self.tasks.read().map_err(|_| poison_err())?;
        let mut pending: Vec<CheckTask> = tasks
            .values()
            .filter(|task| ProcessingState::PENDING.contains(&task.processing))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(pending)
    }

    async fn set_processing(&self, task_id: &TaskId, state: ProcessingState) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(|_| poison_err())?;
        let task = tasks.get_mut(task_id).ok_or_else(|| Error::TaskNotFound {
            task_id: task_id.clone(),
        })?;
        task.processing = state;
        Ok(())
    }
}

#[async_trait]
impl SummaryStore for InMemoryStores {
    async fn summary(&self, event_id: &EventId, mr_url: &str) -> Result<Option<CheckSummary>> {
        let summaries = self.summaries.read().map_err(|_| poison_err())?;
        Ok(summaries
            .get(&(event_id.clone(), mr_url.to_string()))
            .cloned())
    }

    async fn put_summary(&self, summary: CheckSummary) -> Result<()> {
        let mut summaries = self.summaries.write().map_err(|_| poison_err())?;
        summaries.insert((summary.event_id.clone(), summary.mr_url.clone()), summary);
        Ok(())
    }

    async fn summaries_for_event(&self, event_id: &EventId) -> Result<Vec<CheckSummary>> {
        let summaries = self.summaries.read().map_err(|_| poison_err())?;
        let mut matching: Vec<CheckSummary> = summaries
            .values()
            .filter(|summary| &summary.event_id == event_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.mr_url.cmp(&b.mr_url));
        Ok(matching)
    }
}

#[async_trait]
impl DefectStore for InMemoryStores {
    async fn upsert(&self, defect: DefectRecord) -> Result<()> {
        let shard = self.shard(&defect.defect_id);
        let mut shard = shard.write().map_err(|_| poison_err())?;
        shard.insert((defect.task_id.clone(), defect.defect_id.clone()), defect);
        Ok(())
    }

    async fn defects_for_task(&self, task_id: &TaskId) -> Result<Vec<DefectRecord>> {
        let mut matching = Vec::new();
        for shard in &self.defect_shards {
            let shard = shard.read().map_err(|_| poison_err())?;
            matching.extend(
                shard
                    .values()
                    .filter(|defect| &defect.task_id == task_id)
                    .cloned(),
            );
        }
        matching.sort_by(|a, b| a.defect_id.cmp(&b.defect_id));
        Ok(matching)
    }

    async fn remove_for_task(&self, task_id: &TaskId) -> Result<u64> {
        let mut removed = 0_u64;
        for shard in &self.defect_shards {
            let mut shard = shard.write().map_err(|_| poison_err())?;
            let before = shard.len();
            shard.retain(|(owner, _), _| owner != task_id);
            removed += (before - shard.len()) as u64;
        }
        Ok(removed)
    }
}

#[async_trait]
impl FragmentStore for InMemoryStores {
    async fn fragment(&self, issue_key: &str) -> Result<Option<FossFragment>> {
        let fragments = self.fragments.read().map_err(|_| poison_err())?;
        Ok(fragments.get(issue_key).cloned())
    }

    async fn fragments_for_task(&self, task_id: &TaskId) -> Result<Vec<FossFragment>> {
        let fragments = self.fragments.read().map_err(|_| poison_err())?;
        let mut matching: Vec<FossFragment> = fragments
            .values()
            .filter(|fragment| &fragment.task_id == task_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.issue_key.cmp(&b.issue_key));
        Ok(matching)
    }

    async fn replace_for_task(
        &self,
        task_id: &TaskId,
        fragments: Vec<FossFragment>,
    ) -> Result<()> {
        // One write lock covers remove and insert: readers see old or new,
        // never the gap in between.
        let mut stored = self.fragments.write().map_err(|_| poison_err())?;
        stored.retain(|_, fragment| &fragment.task_id != task_id);
        for fragment in fragments {
            stored.insert(fragment.issue_key.clone(), fragment);
        }
        Ok(())
    }

    async fn remove_for_task(&self, task_id: &TaskId) -> Result<u64> {
        let mut fragments = self.fragments.write().map_err(|_| poison_err())?;
        let before = fragments.len();
        fragments.retain(|_, fragment| &fragment.task_id != task_id);
        Ok((before - fragments.len()) as u64)
    }
}
