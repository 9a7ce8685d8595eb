//! Scriptable in-memory [`CheckBackend`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use codegate_core::id::TaskId;

use crate::client::{CheckBackend, DetailPage, SeverityFilter, SummaryPayload, TaskProgress};
use crate::error::{Error, Result};
use crate::model::{CheckStatus, DefectRecord};

#[derive(Debug, Default)]
struct MockState {
    progress: HashMap<TaskId, CheckStatus>,
    summaries: HashMap<TaskId, SummaryPayload>,
    defects: HashMap<TaskId, Vec<DefectRecord>>,
    failing_offsets: HashMap<TaskId, HashSet<u64>>,
    last_region: Option<String>,
    progress_calls: u64,
    summary_calls: u64,
    detail_calls: u64,
}

/// In-memory [`CheckBackend`] whose responses are scripted per task.
///
/// Call counters let tests assert how often the engine re-fetched, which is
/// how idempotence and short-circuiting are verified.
#[derive(Debug, Default)]
pub struct MockCheckBackend {
    state: Mutex<MockState>,
}

impl MockCheckBackend {
    /// Creates an empty backend; every lookup fails until scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the progress response for a task.
    pub fn set_progress(&self, task_id: &TaskId, status: CheckStatus) {
        self.lock().progress.insert(task_id.clone(), status);
    }

    /// Scripts the summary response for a task.
    pub fn set_summary(&self, task_id: &TaskId, summary: SummaryPayload) {
        self.lock().summaries.insert(task_id.clone(), summary);
    }

    /// Scripts the full defect list for a task; pages are sliced from it.
    pub fn set_defects(&self, task_id: &TaskId, defects: Vec<DefectRecord>) {
        self.lock().defects.insert(task_id.clone(), defects);
    }

    /// Makes the detail fetch at the given offset fail once scripted.
    pub fn fail_details_at(&self, task_id: &TaskId, offset: u64) {
        self.lock()
            .failing_offsets
            .entry(task_id.clone())
            .or_default()
            .insert(offset);
    }

    /// Number of progress fetches served so far.
    #[must_use]
    pub fn progress_calls(&self) -> u64 {
        self.lock().progress_calls
    }

    /// Number of summary fetches served so far.
    #[must_use]
    pub fn summary_calls(&self) -> u64 {
        self.lock().summary_calls
    }

    /// Number of detail-page fetches served so far.
    #[must_use]
    pub fn detail_calls(&self) -> u64 {
        self.lock().detail_calls
    }

    /// Region passed with the most recent fetch, if any.
    #[must_use]
    pub fn last_region(&self) -> Option<String> {
        self.lock().last_region.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CheckBackend for MockCheckBackend {
    async fn task_progress(&self, task_id: &TaskId, region: &str) -> Result<TaskProgress> {
        let mut state = self.lock();
        state.last_region = Some(region.to_string());
        state.progress_calls += 1;
        state
            .progress
            .get(task_id)
            .map(|status| TaskProgress { status: *status })
            .ok_or_else(|| Error::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    async fn task_summary(
        &self,
        task_id: &TaskId,
        region: &str,
    ) -> Result<Option<SummaryPayload>> {
        let mut state = self.lock();
        state.last_region = Some(region.to_string());
        state.summary_calls += 1;
        Ok(state.summaries.get(task_id).copied())
    }

    async fn task_details(
        &self,
        task_id: &TaskId,
        offset: u64,
        limit: u32,
        region: &str,
        filter: SeverityFilter,
    ) -> Result<Option<DetailPage>> {
        let mut state = self.lock();
        state.last_region = Some(region.to_string());
        state.detail_calls += 1;

        if let Some(offsets) = state.failing_offsets.get_mut(task_id) {
            if offsets.remove(&offset) {
                return Err(Error::fetch(format!(
                    "scripted failure for task {task_id} at offset {offset}"
                )));
            }
        }

        let Some(defects) = state.defects.get(task_id) else {
            return Ok(None);
        };

        let matching: Vec<&DefectRecord> = defects
            .iter()
            .filter(|defect| filter.matches(&defect.severity))
            .collect();
        let total = matching.len() as u64;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= matching.len() {
            return Ok(if offset == 0 && total == 0 {
                Some(DetailPage {
                    total: 0,
                    defects: Vec::new(),
                })
            } else {
                None
            });
        }

        let end = start.saturating_add(limit).min(matching.len());
        Ok(Some(DetailPage {
            total,
            defects: matching[start..end].iter().map(|d| (*d).clone()).collect(),
        }))
    }
}
