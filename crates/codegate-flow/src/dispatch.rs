//! Periodic fan-out of reconciliation and sync work.
//!
//! Two independent triggers share the dispatcher:
//!
//! 1. **Recent-event reconciliation**: selects still-running events with
//!    activity inside the polling window and merges each under its mutex.
//! 2. **Pending-sync drain**: selects tasks in a pending state and runs the
//!    detail sync pipeline for each.
//!
//! Both fan out onto semaphore-bounded worker sets; submission awaits a
//! permit instead of queueing unboundedly, so a slow cycle applies
//! backpressure to itself rather than piling up work. A failure in one
//! event or task is logged and counted, never propagated to the batch.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use codegate_core::id::EventId;
use codegate_core::kv::KeyValueStore;
use codegate_core::observability::{reconcile_span, sync_span};

use crate::client::CheckBackend;
use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::merge::{MergeEngine, MergeOutcome};
use crate::metrics::FlowMetrics;
use crate::mutex::EventMutex;
use crate::store::{DefectStore, EventStore, FragmentStore, SummaryStore, TaskStore};
use crate::sync::{DetailSyncPipeline, SyncOutcome};

/// Counters from one recent-event reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Events selected by the polling window.
    pub examined: usize,
    /// Merge passes that ran to a decision (still running or finalized).
    pub merged: usize,
    /// Events finalized this cycle.
    pub finalized: usize,
    /// Events forced to a timeout verdict this cycle.
    pub timed_out: usize,
    /// Events skipped because their mutex stayed busy.
    pub busy: usize,
    /// Events whose merge failed; retried next cycle.
    pub failed: usize,
}

/// Counters from one pending-sync drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Tasks selected for draining.
    pub examined: usize,
    /// Tasks whose details synced.
    pub synced: usize,
    /// Tasks left in retry (check still running, summary pending, fetch error).
    pub retried: usize,
    /// Tasks that went stale.
    pub stale: usize,
    /// Tasks whose page sync failed and was compensated.
    pub failed: usize,
    /// Create-failed tasks fed back without fetching.
    pub feedback: usize,
}

enum EventOutcome {
    Merged(MergeOutcome),
    Busy,
    Failed,
}

/// Entry point tying the mutex, merge engine, and sync pipeline together.
pub struct PollDispatcher {
    config: ReconcilerConfig,
    mutex: EventMutex,
    merge: Arc<MergeEngine>,
    sync: Arc<DetailSyncPipeline>,
    events: Arc<dyn EventStore>,
    tasks: Arc<dyn TaskStore>,
    metrics: FlowMetrics,
}

impl PollDispatcher {
    /// Wires a dispatcher from its stores and backend.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReconcilerConfig,
        kv: Arc<dyn KeyValueStore>,
        backend: Arc<dyn CheckBackend>,
        events: Arc<dyn EventStore>,
        tasks: Arc<dyn TaskStore>,
        summaries: Arc<dyn SummaryStore>,
        defects: Arc<dyn DefectStore>,
        fragments: Arc<dyn FragmentStore>,
    ) -> Self {
        let mutex = EventMutex::new(kv, config.lock_ttl, config.lock_wait_budget);
        let merge = Arc::new(MergeEngine::new(
            config.clone(),
            Arc::clone(&events),
            Arc::clone(&summaries),
        ));
        let sync = Arc::new(DetailSyncPipeline::new(
            config.clone(),
            backend,
            Arc::clone(&events),
            Arc::clone(&tasks),
            summaries,
            defects,
            fragments,
        ));
        Self {
            config,
            mutex,
            merge,
            sync,
            events,
            tasks,
            metrics: FlowMetrics::new(),
        }
    }

    /// Runs one recent-event reconciliation cycle.
    ///
    /// # Errors
    ///
    /// Returns a storage error from event selection; per-event failures are
    /// counted, not propagated.
    pub async fn reconcile_recent_events(&self) -> Result<ReconcileSummary> {
        let cycle_start = Instant::now();
        let cutoff = Utc::now() - self.config.polling_window;
        let event_ids = self.events.running_event_ids_since(cutoff).await?;

        let mut summary = ReconcileSummary {
            examined: event_ids.len(),
            ..ReconcileSummary::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.event_pool_size));
        let mut workers: JoinSet<EventOutcome> = JoinSet::new();

        for event_id in event_ids {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| Error::storage("event worker pool closed"))?;
            let mutex = self.mutex.clone();
            let merge = Arc::clone(&self.merge);
            let metrics = self.metrics;

            workers.spawn(async move {
                let _permit = permit;
                let span = reconcile_span("merge", event_id.as_str());
                merge_one(&mutex, &merge, metrics, &event_id)
                    .instrument(span)
                    .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            let Ok(outcome) = joined else {
                summary.failed += 1;
                continue;
            };
            match outcome {
                EventOutcome::Merged(MergeOutcome::AlreadyDone) => {}
                EventOutcome::Merged(MergeOutcome::StillRunning) => summary.merged += 1,
                EventOutcome::Merged(MergeOutcome::Finalized { .. }) => {
                    summary.merged += 1;
                    summary.finalized += 1;
                }
                EventOutcome::Merged(MergeOutcome::TimedOut) => {
                    summary.merged += 1;
                    summary.timed_out += 1;
                }
                EventOutcome::Busy => summary.busy += 1,
                EventOutcome::Failed => summary.failed += 1,
            }
        }

        self.metrics
            .observe_poll_cycle("reconcile", cycle_start.elapsed());
        tracing::info!(
            examined = summary.examined,
            merged = summary.merged,
            finalized = summary.finalized,
            timed_out = summary.timed_out,
            busy = summary.busy,
            failed = summary.failed,
            "reconcile cycle finished"
        );
        Ok(summary)
    }

    /// Drains tasks in a pending state through the detail sync pipeline.
    ///
    /// # Errors
    ///
    /// Returns a storage error from task selection; per-task failures are
    /// counted, not propagated.
    pub async fn drain_pending_tasks(&self) -> Result<DrainSummary> {
        let cycle_start = Instant::now();
        let pending = self.tasks.pending_tasks().await?;

        let mut summary = DrainSummary {
            examined: pending.len(),
            ..DrainSummary::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.drain_pool_size));
        let mut workers: JoinSet<Option<SyncOutcome>> = JoinSet::new();

        for task in pending {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| Error::storage("drain worker pool closed"))?;
            let sync = Arc::clone(&self.sync);
            let metrics = self.metrics;

            let span = sync_span("details", task.task_id.as_str());
            workers.spawn(
                async move {
                    let _permit = permit;
                    let sync_start = Instant::now();
                    match sync.sync_task(&task).await {
                        Ok(outcome) => {
                            metrics.record_sync(outcome_label(outcome), sync_start.elapsed());
                            if let SyncOutcome::Synced { defects, fragments } = outcome {
                                metrics.record_defects_upserted(defects);
                                metrics.record_fragments_stored(fragments);
                            }
                            Some(outcome)
                        }
                        Err(error) => {
                            tracing::warn!(
                                task_id = task.task_id.as_str(),
                                %error,
                                "task sync attempt failed"
                            );
                            metrics.record_sync("error", sync_start.elapsed());
                            None
                        }
                    }
                }
                .instrument(span),
            );
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some(SyncOutcome::Synced { .. })) => summary.synced += 1,
                Ok(Some(SyncOutcome::CreateFailedFeedback)) => summary.feedback += 1,
                Ok(Some(SyncOutcome::StillRunning | SyncOutcome::SummaryPending)) => {
                    summary.retried += 1;
                }
                Ok(Some(SyncOutcome::Stale)) => summary.stale += 1,
                Ok(Some(SyncOutcome::PageFailure)) => summary.failed += 1,
                Ok(None) | Err(_) => summary.retried += 1,
            }
        }

        self.metrics
            .observe_poll_cycle("drain", cycle_start.elapsed());
        tracing::info!(
            examined = summary.examined,
            synced = summary.synced,
            retried = summary.retried,
            stale = summary.stale,
            failed = summary.failed,
            feedback = summary.feedback,
            "drain cycle finished"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for PollDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn merge_one(
    mutex: &EventMutex,
    merge: &MergeEngine,
    metrics: FlowMetrics,
    event_id: &EventId,
) -> EventOutcome {
    let guard = match mutex.acquire(event_id).await {
        Ok(guard) => guard,
        Err(Error::LockBusy { key, waited_ms }) => {
            tracing::debug!(key, waited_ms, "event mutex stayed busy; skipping this cycle");
            metrics.record_lock_contention();
            return EventOutcome::Busy;
        }
        Err(error) => {
            tracing::warn!(event_id = event_id.as_str(), %error, "mutex acquisition failed");
            return EventOutcome::Failed;
        }
    };

    let merge_start = Instant::now();
    let result = merge.merge_event(event_id).await;
    let elapsed = merge_start.elapsed();

    if let Err(error) = guard.release().await {
        tracing::warn!(event_id = event_id.as_str(), %error, "event mutex release failed");
    }

    match result {
        Ok(outcome) => {
            metrics.record_merge(merge_label(outcome), elapsed);
            EventOutcome::Merged(outcome)
        }
        Err(error) => {
            tracing::warn!(event_id = event_id.as_str(), %error, "merge pass failed");
            metrics.record_merge("error", elapsed);
            EventOutcome::Failed
        }
    }
}

const fn merge_label(outcome: MergeOutcome) -> &'static str {
    match outcome {
        MergeOutcome::AlreadyDone => "already_done",
        MergeOutcome::StillRunning => "running",
        MergeOutcome::Finalized { .. } => "finalized",
        MergeOutcome::TimedOut => "timed_out",
    }
}

const fn outcome_label(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Synced { .. } => "synced",
        SyncOutcome::CreateFailedFeedback => "feedback",
        SyncOutcome::StillRunning => "still_running",
        SyncOutcome::SummaryPending => "summary_pending",
        SyncOutcome::Stale => "stale",
        SyncOutcome::PageFailure => "page_failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    use codegate_core::id::TaskId;
    use codegate_core::kv::memory::InMemoryKv;

    use crate::client::memory::MockCheckBackend;
    use crate::client::SummaryPayload;
    use crate::model::{
        normalize_pr_key, AggregateEvent, CheckResult, CheckStatus, CheckSummary, CheckTask,
        InnerSnapshot, ProcessingState, SubCheck, SubCheckResult,
    };
    use crate::store::memory::InMemoryStores;

    const PR: &str = "https://gitee.com/acme/widget/pulls/1";

    struct Fixture {
        dispatcher: PollDispatcher,
        kv: Arc<InMemoryKv>,
        backend: Arc<MockCheckBackend>,
        stores: Arc<InMemoryStores>,
    }

    fn fixture(config: ReconcilerConfig) -> Fixture {
        let kv = Arc::new(InMemoryKv::new());
        let backend = Arc::new(MockCheckBackend::new());
        let stores = Arc::new(InMemoryStores::new());
        let dispatcher = PollDispatcher::new(
            config,
            kv.clone(),
            backend.clone(),
            stores.clone(),
            stores.clone(),
            stores.clone(),
            stores.clone(),
            stores.clone(),
        );
        Fixture {
            dispatcher,
            kv,
            backend,
            stores,
        }
    }

    fn tracked_config() -> ReconcilerConfig {
        ReconcilerConfig {
            repo_allow_list: vec!["https://gitee.com/acme/widget.git".to_string()],
            lock_wait_budget: StdDuration::from_millis(50),
            ..ReconcilerConfig::default()
        }
    }

    async fn seed_finalizable_event(stores: &InMemoryStores, event_id: &str) {
        let event = EventId::new(event_id);
        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 1, Utc::now()))
            .await
            .unwrap();

        let mut sub_checks = BTreeMap::new();
        sub_checks.insert(
            normalize_pr_key(PR),
            vec![SubCheck {
                name: "lint".to_string(),
                result: SubCheckResult::Pass,
            }],
        );
        stores
            .put_inner_snapshot(InnerSnapshot {
                event_id: event.clone(),
                sub_checks,
                total_result: Some(CheckResult::Pass),
                running_at: Some(Utc::now()),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        stores
            .put_summary(CheckSummary {
                event_id: event,
                task_id: TaskId::new("t1"),
                mr_url: PR.to_string(),
                issue_count: 0,
                solve_count: 0,
                result: CheckResult::Pass,
                status: CheckStatus::Success,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reconcile_finalizes_ready_events() {
        let fixture = fixture(tracked_config());
        seed_finalizable_event(&fixture.stores, "e1").await;
        seed_finalizable_event(&fixture.stores, "e2").await;

        let summary = fixture.dispatcher.reconcile_recent_events().await.unwrap();
        assert_eq!(summary.examined, 2);
        assert_eq!(summary.merged, 2);
        assert_eq!(summary.finalized, 2);
        assert_eq!(summary.failed, 0);

        let aggregate = fixture
            .stores
            .aggregate(&EventId::new("e1"))
            .await
            .unwrap()
            .unwrap();
        assert!(aggregate.is_done());
    }

    #[tokio::test]
    async fn finalized_events_leave_the_window() {
        let fixture = fixture(tracked_config());
        seed_finalizable_event(&fixture.stores, "e1").await;

        fixture.dispatcher.reconcile_recent_events().await.unwrap();
        let second = fixture.dispatcher.reconcile_recent_events().await.unwrap();
        assert_eq!(second.examined, 0);
    }

    #[tokio::test]
    async fn held_mutex_skips_the_event_not_the_batch() {
        let fixture = fixture(tracked_config());
        seed_finalizable_event(&fixture.stores, "e1").await;
        seed_finalizable_event(&fixture.stores, "e2").await;

        // Another holder keeps e2's lease for the whole cycle.
        let other = EventMutex::new(
            fixture.kv.clone(),
            StdDuration::from_secs(60),
            StdDuration::from_millis(50),
        );
        let held = other.acquire(&EventId::new("e2")).await.unwrap();

        let summary = fixture.dispatcher.reconcile_recent_events().await.unwrap();
        assert_eq!(summary.finalized, 1);
        assert_eq!(summary.busy, 1);

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn drain_routes_tasks_by_state() {
        let fixture = fixture(ReconcilerConfig::default());
        let event = EventId::new("e1");

        let synced_task = CheckTask {
            task_id: TaskId::new("t1"),
            event_id: event.clone(),
            mr_url: PR.to_string(),
            processing: ProcessingState::New,
            created_at: Utc::now(),
        };
        fixture.stores.put_task(synced_task.clone()).await.unwrap();
        fixture
            .backend
            .set_progress(&synced_task.task_id, CheckStatus::Success);
        fixture.backend.set_summary(
            &synced_task.task_id,
            SummaryPayload {
                issue_count: 0,
                solve_count: 0,
                status: CheckStatus::Success,
            },
        );

        let feedback_task = CheckTask {
            task_id: TaskId::new("t2"),
            event_id: event.clone(),
            mr_url: "https://gitee.com/acme/widget/pulls/2".to_string(),
            processing: ProcessingState::CreateFailed,
            created_at: Utc::now(),
        };
        fixture.stores.put_task(feedback_task).await.unwrap();

        let running_task = CheckTask {
            task_id: TaskId::new("t3"),
            event_id: event,
            mr_url: "https://gitee.com/acme/widget/pulls/3".to_string(),
            processing: ProcessingState::Retry,
            created_at: Utc::now(),
        };
        fixture.stores.put_task(running_task.clone()).await.unwrap();
        fixture
            .backend
            .set_progress(&running_task.task_id, CheckStatus::Running);

        let summary = fixture.dispatcher.drain_pending_tasks().await.unwrap();
        assert_eq!(summary.examined, 3);
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.feedback, 1);
        assert_eq!(summary.retried, 1);
    }

    #[tokio::test]
    async fn empty_cycles_are_clean_no_ops() {
        let fixture = fixture(ReconcilerConfig::default());
        let reconcile = fixture.dispatcher.reconcile_recent_events().await.unwrap();
        assert_eq!(reconcile, ReconcileSummary::default());

        let drain = fixture.dispatcher.drain_pending_tasks().await.unwrap();
        assert_eq!(drain, DrainSummary::default());
    }
}
