//! Paginated, idempotent sync of defect details for completed tasks.
//!
//! Page 0 is fetched synchronously so the caller gets an immediate echo of
//! the result; remaining pages fan out onto a semaphore-bounded set of
//! workers. Every defect write is a keyed upsert, so repeated delivery of
//! the same page never duplicates rows. Any page failure compensates by
//! deleting what was inserted and marking the task failed, leaving no
//! partially-synced state behind.

pub mod foss;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use codegate_core::id::TaskId;

use crate::client::{CheckBackend, SeverityFilter, SummaryPayload};
use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::model::{
    CheckResult, CheckStatus, CheckSummary, CheckTask, DefectRecord, ProcessingState,
};
use crate::store::{DefectStore, EventStore, FragmentStore, SummaryStore, TaskStore};

/// Result of one sync attempt for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Details and summary were synced.
    Synced {
        /// Defect rows upserted.
        defects: u64,
        /// Fragments stored.
        fragments: u64,
    },
    /// The task's creation had failed; failure feedback was written without
    /// fetching anything.
    CreateFailedFeedback,
    /// The backend still reports the check as running; retry next drain.
    StillRunning,
    /// The check finished but no summary exists yet; retry next drain.
    SummaryPending,
    /// The task's event went stale before sync completed.
    Stale,
    /// A page fetch failed; inserted details were compensated away.
    PageFailure,
}

/// Syncs one completed task's summary and defect details.
pub struct DetailSyncPipeline {
    config: ReconcilerConfig,
    backend: Arc<dyn CheckBackend>,
    events: Arc<dyn EventStore>,
    tasks: Arc<dyn TaskStore>,
    summaries: Arc<dyn SummaryStore>,
    defects: Arc<dyn DefectStore>,
    fragments: Arc<dyn FragmentStore>,
}

impl DetailSyncPipeline {
    /// Creates a pipeline over the given backend and stores.
    #[must_use]
    pub fn new(
        config: ReconcilerConfig,
        backend: Arc<dyn CheckBackend>,
        events: Arc<dyn EventStore>,
        tasks: Arc<dyn TaskStore>,
        summaries: Arc<dyn SummaryStore>,
        defects: Arc<dyn DefectStore>,
        fragments: Arc<dyn FragmentStore>,
    ) -> Self {
        Self {
            config,
            backend,
            events,
            tasks,
            summaries,
            defects,
            fragments,
        }
    }

    /// Runs one sync attempt for a task.
    ///
    /// # Errors
    ///
    /// Returns a fetch or storage error when the attempt could not run to a
    /// decision; the task is left in `Retry` for the next drain.
    pub async fn sync_task(&self, task: &CheckTask) -> Result<SyncOutcome> {
        if task.processing == ProcessingState::CreateFailed {
            return self.feedback_without_fetch(task).await;
        }

        if Utc::now() - task.created_at > self.config.staleness {
            tracing::warn!(task_id = task.task_id.as_str(), "task went stale before sync");
            self.tasks
                .set_processing(&task.task_id, ProcessingState::SyncTimeOut)
                .await?;
            // The event record carries the timeout too; the merge never
            // revisits this event and its callers see a terminal verdict.
            self.events
                .update_event_outcome(&task.event_id, CheckResult::TimeOut, Utc::now())
                .await?;
            return Ok(SyncOutcome::Stale);
        }

        self.tasks
            .set_processing(&task.task_id, ProcessingState::Syncing)
            .await?;

        let progress = match self
            .backend
            .task_progress(&task.task_id, &self.config.region)
            .await
        {
            Ok(progress) => progress,
            Err(error) => {
                self.tasks
                    .set_processing(&task.task_id, ProcessingState::Retry)
                    .await?;
                return Err(error);
            }
        };
        if !progress.is_terminal() {
            self.tasks
                .set_processing(&task.task_id, ProcessingState::Retry)
                .await?;
            return Ok(SyncOutcome::StillRunning);
        }

        let Some(payload) = self
            .backend
            .task_summary(&task.task_id, &self.config.region)
            .await?
        else {
            self.tasks
                .set_processing(&task.task_id, ProcessingState::Retry)
                .await?;
            return Ok(SyncOutcome::SummaryPending);
        };

        let result = judge_result(&payload);

        // Non-success checks get feedback without an issue-count judgement
        // and carry no fetchable details.
        if payload.status != CheckStatus::Success {
            self.write_summary(task, &payload, result).await?;
            self.tasks
                .set_processing(&task.task_id, ProcessingState::SyncSuccess)
                .await?;
            return Ok(SyncOutcome::Synced {
                defects: 0,
                fragments: 0,
            });
        }

        match self.sync_details(task, &payload).await {
            Ok((defects, fragments)) => {
                self.write_summary(task, &payload, result).await?;
                self.tasks
                    .set_processing(&task.task_id, ProcessingState::SyncSuccess)
                    .await?;
                Ok(SyncOutcome::Synced { defects, fragments })
            }
            Err(error) => {
                tracing::warn!(
                    task_id = task.task_id.as_str(),
                    %error,
                    "page fetch failed; compensating inserted details"
                );
                self.compensate(task, &payload).await?;
                Ok(SyncOutcome::PageFailure)
            }
        }
    }

    /// Routes a task whose creation failed straight to feedback.
    async fn feedback_without_fetch(&self, task: &CheckTask) -> Result<SyncOutcome> {
        let summary = CheckSummary {
            event_id: task.event_id.clone(),
            task_id: task.task_id.clone(),
            mr_url: task.mr_url.clone(),
            issue_count: 0,
            solve_count: 0,
            result: CheckResult::Failed,
            status: CheckStatus::Error,
        };
        self.summaries.put_summary(summary).await?;
        self.tasks
            .set_processing(&task.task_id, ProcessingState::SyncSuccess)
            .await?;
        Ok(SyncOutcome::CreateFailedFeedback)
    }

    /// Fetches all detail pages and stores defects and fragments.
    async fn sync_details(&self, task: &CheckTask, payload: &SummaryPayload) -> Result<(u64, u64)> {
        let passes: &[SeverityFilter] =
            if payload.solve_count >= large_threshold(&self.config) {
                // Past the threshold a single query would exceed the
                // backend's result cap; split by severity band.
                &[SeverityFilter::Default, SeverityFilter::Ignored]
            } else {
                &[SeverityFilter::All]
            };

        let mut defect_count = 0_u64;
        let mut foss_defects = Vec::new();
        for filter in passes {
            let (inserted, foss) = self.sync_pass(&task.task_id, *filter).await?;
            defect_count += inserted;
            foss_defects.extend(foss);
        }

        let fragment_count =
            foss::store_fragments(&self.fragments, &task.task_id, &foss_defects).await?;
        Ok((defect_count, fragment_count))
    }

    /// Fetches one severity pass: page 0 synchronously, the rest fanned out.
    async fn sync_pass(
        &self,
        task_id: &TaskId,
        filter: SeverityFilter,
    ) -> Result<(u64, Vec<DefectRecord>)> {
        let page_size = self.config.page_size;
        let Some(first) = self
            .backend
            .task_details(task_id, 0, page_size, &self.config.region, filter)
            .await?
        else {
            return Ok((0, Vec::new()));
        };

        let total = first.total;
        let (mut inserted, mut foss_defects) = store_page(&self.defects, first.defects).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.page_pool_size));
        let mut workers: JoinSet<Result<(u64, Vec<DefectRecord>)>> = JoinSet::new();

        let mut offset = u64::from(page_size);
        while offset < total {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| Error::storage("page worker pool closed"))?;
            let backend = Arc::clone(&self.backend);
            let defects = Arc::clone(&self.defects);
            let task_id = task_id.clone();
            let region = self.config.region.clone();

            workers.spawn(async move {
                let _permit = permit;
                let Some(page) = backend
                    .task_details(&task_id, offset, page_size, &region, filter)
                    .await?
                else {
                    return Ok((0, Vec::new()));
                };
                store_page(&defects, page.defects).await
            });

            offset += u64::from(page_size);
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let page_result =
                joined.map_err(|e| Error::storage(format!("page worker panicked: {e}")))?;
            match page_result {
                Ok((count, foss)) => {
                    inserted += count;
                    foss_defects.extend(foss);
                }
                Err(error) if first_error.is_none() => first_error = Some(error),
                Err(_) => {}
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        Ok((inserted, foss_defects))
    }

    /// Removes everything inserted for the task and records the failure.
    async fn compensate(&self, task: &CheckTask, payload: &SummaryPayload) -> Result<()> {
        let removed = self.defects.remove_for_task(&task.task_id).await?;
        self.fragments.remove_for_task(&task.task_id).await?;
        tracing::info!(
            task_id = task.task_id.as_str(),
            removed,
            "compensating delete completed"
        );

        let summary = CheckSummary {
            event_id: task.event_id.clone(),
            task_id: task.task_id.clone(),
            mr_url: task.mr_url.clone(),
            issue_count: payload.issue_count,
            solve_count: payload.solve_count,
            result: CheckResult::Error,
            status: CheckStatus::Error,
        };
        self.summaries.put_summary(summary).await?;
        self.tasks
            .set_processing(&task.task_id, ProcessingState::SyncFailed)
            .await
    }

    async fn write_summary(
        &self,
        task: &CheckTask,
        payload: &SummaryPayload,
        result: CheckResult,
    ) -> Result<()> {
        // Past the threshold the solved count is stored negated, marking
        // summaries whose details were synced in split passes.
        let solve_count = if payload.solve_count >= large_threshold(&self.config) {
            -payload.solve_count
        } else {
            payload.solve_count
        };

        self.summaries
            .put_summary(CheckSummary {
                event_id: task.event_id.clone(),
                task_id: task.task_id.clone(),
                mr_url: task.mr_url.clone(),
                issue_count: payload.issue_count,
                solve_count,
                result,
                status: payload.status,
            })
            .await
    }
}

impl std::fmt::Debug for DetailSyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailSyncPipeline").finish_non_exhaustive()
    }
}

fn large_threshold(config: &ReconcilerConfig) -> i64 {
    i64::try_from(config.large_result_threshold).unwrap_or(i64::MAX)
}

/// Issue-count judgement applies only to checks that actually succeeded.
fn judge_result(payload: &SummaryPayload) -> CheckResult {
    match payload.status {
        CheckStatus::Success => {
            if payload.issue_count > 0 {
                CheckResult::NoPass
            } else {
                CheckResult::Pass
            }
        }
        CheckStatus::Failed | CheckStatus::Running => CheckResult::Failed,
        CheckStatus::Error => CheckResult::Error,
        CheckStatus::NoCheck => CheckResult::NotConfigured,
    }
}

/// Upserts a page's ordinary defects; FossScan defects are routed back for
/// fragment curation.
async fn store_page(
    defects: &Arc<dyn DefectStore>,
    page: Vec<DefectRecord>,
) -> Result<(u64, Vec<DefectRecord>)> {
    let mut inserted = 0_u64;
    let mut foss = Vec::new();
    for defect in page {
        if defect.is_foss() {
            foss.push(defect);
        } else {
            defects.upsert(defect).await?;
            inserted += 1;
        }
    }
    Ok((inserted, foss))
}
