//! Upstream check backend access.
//!
//! The [`CheckBackend`] trait is the only seam between the engine and the
//! outside track's check service. This separation enables:
//!
//! - **Testing**: [`memory::MockCheckBackend`] scripts progress, summaries,
//!   and detail pages without a network
//! - **Production**: [`http::HttpCheckBackend`] talks JSON over HTTP with
//!   timeouts and bounded retries

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use codegate_core::id::TaskId;

use crate::error::Result;
use crate::model::{CheckStatus, DefectRecord};

/// Severities excluded from the default detail pass.
pub const IGNORED_SEVERITIES: [&str; 2] = ["prompt", "ignore"];

/// Execution progress of a check task on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    /// Current backend status.
    pub status: CheckStatus,
}

impl TaskProgress {
    /// Returns true once the backend will not change this task again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            CheckStatus::Success | CheckStatus::Failed | CheckStatus::Error | CheckStatus::NoCheck
        )
    }
}

/// Aggregated counts for a finished check task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPayload {
    /// Open issue count.
    pub issue_count: i64,
    /// Solved issue count.
    pub solve_count: i64,
    /// Backend status at summary time.
    pub status: CheckStatus,
}

/// Which severity band a detail fetch covers.
///
/// Small result sets fetch everything at once. Past the large-result
/// threshold the fetch splits into a default pass and an ignored pass so
/// neither query exceeds the backend's result cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityFilter {
    /// All severities in one pass.
    All,
    /// Severities that gate the merge.
    Default,
    /// Advisory severities only.
    Ignored,
}

impl SeverityFilter {
    /// Whether a defect of the given severity belongs to this pass.
    #[must_use]
    pub fn matches(&self, severity: &str) -> bool {
        let ignored = IGNORED_SEVERITIES
            .iter()
            .any(|candidate| severity.eq_ignore_ascii_case(candidate));
        match self {
            Self::All => true,
            Self::Default => !ignored,
            Self::Ignored => ignored,
        }
    }

    /// Query-parameter value for this pass.
    #[must_use]
    pub const fn as_query(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Default => "default",
            Self::Ignored => "ignored",
        }
    }
}

/// One page of defect details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailPage {
    /// Total matching defects across all pages of this pass.
    pub total: u64,
    /// Defects on this page.
    pub defects: Vec<DefectRecord>,
}

/// Read access to the outside track's check service.
///
/// Every operation carries the deployment region the check ran in; the
/// service shards its records by region and cannot resolve a task without
/// it.
#[async_trait]
pub trait CheckBackend: Send + Sync {
    /// Fetches the execution progress of a task.
    async fn task_progress(&self, task_id: &TaskId, region: &str) -> Result<TaskProgress>;

    /// Fetches the summary counts of a task.
    ///
    /// Returns `None` when the backend has no summary yet.
    async fn task_summary(
        &self,
        task_id: &TaskId,
        region: &str,
    ) -> Result<Option<SummaryPayload>>;

    /// Fetches one page of defect details.
    ///
    /// Returns `None` when the offset is past the end of the result set.
    async fn task_details(
        &self,
        task_id: &TaskId,
        offset: u64,
        limit: u32,
        region: &str,
        filter: SeverityFilter,
    ) -> Result<Option<DetailPage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskProgress {
            status: CheckStatus::Success
        }
        .is_terminal());
        assert!(TaskProgress {
            status: CheckStatus::NoCheck
        }
        .is_terminal());
        assert!(!TaskProgress {
            status: CheckStatus::Running
        }
        .is_terminal());
    }

    #[test]
    fn severity_filter_partitions() {
        assert!(SeverityFilter::Default.matches("serious"));
        assert!(!SeverityFilter::Default.matches("Prompt"));
        assert!(SeverityFilter::Ignored.matches("ignore"));
        assert!(!SeverityFilter::Ignored.matches("general"));
        assert!(SeverityFilter::All.matches("anything"));
    }
}
