//! Data model for the reconciliation engine.
//!
//! The aggregate event is the single piece of mutable shared state in the
//! system; everything else is either immutable input (snapshots, summaries)
//! or independently writable by natural key (defects, fragments).

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use codegate_core::id::{EventId, TaskId};

/// Escape token used for storage-safe PR keys.
///
/// Document-store field names cannot contain dots, so PR URLs are stored
/// with every `.` replaced by this token.
pub const PR_KEY_DOT_ESCAPE: &str = "%2e";

/// Suffix appended to a truncated PR URL to recover the repository URL.
pub const REPO_URL_SUFFIX: &str = ".git";

/// Path segment separating the repository URL from the PR number.
const PULLS_SEGMENT: &str = "/pulls";

/// Verdict of a check, per PR or per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckResult {
    /// The check passed.
    Pass,
    /// The check ran and found gating issues.
    NoPass,
    /// The check failed to produce a result.
    Failed,
    /// The check produced anomalous data (empty sub-checks when results were
    /// expected). Treated as a gate failure, never as a silent pass.
    Error,
    /// The check exceeded its decision deadline. A first-class business
    /// state, not an exception.
    TimeOut,
    /// No check was configured for this PR. Counts as a pass when combining.
    NotConfigured,
}

/// Execution status of a check on the upstream backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    /// The check completed successfully.
    Success,
    /// The check completed with a failure.
    Failed,
    /// The check or its sync hit an error.
    Error,
    /// The check is still executing.
    Running,
    /// The check was never configured for this PR.
    NoCheck,
}

/// Sync lifecycle of a [`CheckTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    /// Created, not yet picked up.
    New,
    /// Task creation on the backend failed; feedback happens without fetching.
    CreateFailed,
    /// A previous attempt failed transiently; eligible for pickup again.
    Retry,
    /// Detail sync is in progress; later poll cycles must not touch the task.
    Syncing,
    /// Detail sync finished.
    SyncSuccess,
    /// Detail sync failed; details were compensated away.
    SyncFailed,
    /// The task's event went stale before sync completed.
    SyncTimeOut,
    /// The event is still collecting PR results.
    Running,
}

impl ProcessingState {
    /// States in which the pending-sync drain picks a task up.
    pub const PENDING: [Self; 3] = [Self::New, Self::CreateFailed, Self::Retry];
}

/// A check requested for one PR of a merge event.
///
/// Created when the check is requested; never deleted, only
/// status-transitioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTask {
    /// Backend task ID.
    pub task_id: TaskId,
    /// The merge event this task belongs to.
    pub event_id: EventId,
    /// The PR under check.
    pub mr_url: String,
    /// Current sync lifecycle state.
    pub processing: ProcessingState,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

/// Per-PR summary of an upstream check run.
///
/// One per (event, PR); overwritten, never appended, on re-fetch — summary
/// sync is idempotent by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSummary {
    /// The merge event.
    pub event_id: EventId,
    /// Backend task ID.
    pub task_id: TaskId,
    /// The PR this summary covers.
    pub mr_url: String,
    /// Open issue count reported by the backend.
    pub issue_count: i64,
    /// Solved issue count. Stored negated once the large-result threshold is
    /// reached, marking summaries whose details were synced in split passes.
    pub solve_count: i64,
    /// Verdict derived from status and issue count.
    pub result: CheckResult,
    /// Raw backend status.
    pub status: CheckStatus,
}

/// A single defect found by a check.
///
/// Natural key is `(task_id, defect_id)`; records are upserted, never
/// duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefectRecord {
    /// Backend task ID.
    pub task_id: TaskId,
    /// The merge event.
    pub event_id: EventId,
    /// File the defect was found in.
    pub file_path: String,
    /// Line number of the defect.
    pub line: u32,
    /// Rule that fired.
    pub rule_name: String,
    /// Severity label from the backend.
    pub severity: String,
    /// Defect status from the backend ("0" = unconfirmed).
    pub status: String,
    /// Stable issue key, shared across re-scans of the same finding.
    pub issue_key: String,
    /// Backend defect ID (numeric string).
    pub defect_id: String,
    /// Checker that produced the defect.
    pub checker: String,
    /// Offending code fragment, when the checker supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
    /// Open-source scan matches; empty for ordinary checkers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scan_results: Vec<FossScanEntry>,
}

impl DefectRecord {
    /// Returns true when this defect came from the open-source scanner and
    /// must be routed to fragment storage instead of the defect shards.
    #[must_use]
    pub fn is_foss(&self) -> bool {
        self.checker.contains("FossScan")
    }
}

/// One matched span inside an open-source scan hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FossHit {
    /// First matched line in the scanned file.
    pub hit_start_line: u32,
    /// Last matched line in the scanned file.
    pub hit_end_line: u32,
}

impl FossHit {
    /// Matched span length in lines.
    #[must_use]
    pub const fn span(&self) -> u32 {
        self.hit_end_line.saturating_sub(self.hit_start_line)
    }
}

/// Matches against one upstream open-source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FossScanEntry {
    /// The open-source file that was matched.
    pub source_file: String,
    /// Matched spans, sorted by start line after curation.
    pub hits: Vec<FossHit>,
}

/// An open-source-scan match record with curated ownership metadata.
///
/// Keyed by `issue_key`. Curated fields are filled in by reviewers and must
/// survive re-scans: a replace copies them forward from the previous
/// fragment with the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FossFragment {
    /// Stable issue key shared across re-scans.
    pub issue_key: String,
    /// Backend task ID of the scan that produced this fragment.
    pub task_id: TaskId,
    /// The merge event.
    pub event_id: EventId,
    /// Backend defect ID.
    pub defect_id: String,
    /// Directory part of the scanned file path.
    pub path: String,
    /// File name part of the scanned file path.
    pub file_name: String,
    /// File suffix, when the name carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    /// Whether a reviewer confirmed the finding.
    pub confirmed: bool,
    /// Scan matches after curation.
    pub scan_results: Vec<FossScanEntry>,
    /// Curated: when the finding was confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_time: Option<DateTime<Utc>>,
    /// Curated: matched component name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    /// Curated: matched component version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_version: Option<String>,
    /// Curated: open-source license/type classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foss_type: Option<String>,
    /// Curated: reviewer remarks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    /// Curated: whether the match is acknowledged as open source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
    /// Curated: owning user ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Curated: owning user name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
}

impl FossFragment {
    /// Copies curated fields forward from a previous fragment with the same
    /// issue key, so reviewer work survives the re-scan.
    pub fn carry_curated_fields(&mut self, previous: &FossFragment) {
        self.confirm_time = previous.confirm_time;
        self.component_name.clone_from(&previous.component_name);
        self.component_version
            .clone_from(&previous.component_version);
        self.foss_type.clone_from(&previous.foss_type);
        self.remarks.clone_from(&previous.remarks);
        self.open = previous.open;
        self.owner_id.clone_from(&previous.owner_id);
        self.owner_name.clone_from(&previous.owner_name);
    }
}

/// One inner-track sub-check result for a PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCheck {
    /// Sub-check name (e.g. a linter or build stage).
    pub name: String,
    /// Result of the sub-check. `Warning` entries are advisory only and are
    /// ignored when combining.
    pub result: SubCheckResult,
}

/// Result of a single inner-track sub-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubCheckResult {
    /// Sub-check passed.
    Pass,
    /// Sub-check found gating issues.
    NoPass,
    /// Sub-check failed to run.
    Failed,
    /// Advisory only; ignored when combining.
    Warning,
}

/// The inner track's snapshot of a merge event.
///
/// Sub-check results are grouped under storage-safe (dot-escaped,
/// percent-encoded) PR keys. A present `total_result` signals the inner
/// track considers itself finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerSnapshot {
    /// The merge event.
    pub event_id: EventId,
    /// Per-PR sub-check results, keyed by encoded PR key.
    pub sub_checks: BTreeMap<String, Vec<SubCheck>>,
    /// Inner track's own total verdict, once it considers itself finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_result: Option<CheckResult>,
    /// When the inner track entered its running phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at: Option<DateTime<Utc>>,
    /// Last snapshot update.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of an [`AggregateEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateStatus {
    /// Still collecting per-PR results.
    Running,
    /// Finalized. Entered exactly once.
    Done,
}

/// The per-event record holding combined results and overall status.
///
/// This is the only resource requiring serialized access; every
/// read-modify-write of it happens under the event mutex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateEvent {
    /// The merge event.
    pub event_id: EventId,
    /// Combined per-PR verdicts, keyed by storage-safe normalized PR key.
    pub per_pr_result: BTreeMap<String, CheckResult>,
    /// Event-level verdict. Set only at finalization or forced timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_result: Option<CheckResult>,
    /// Lifecycle state.
    pub current_status: AggregateStatus,
    /// Number of PRs the event is expected to report for.
    pub expected_pr_count: usize,
    /// Whether a static check was configured for this event at all. When
    /// false the inner track is not applicable and the total comes from the
    /// outside track alone.
    pub check_configured: bool,
    /// When the event was first observed by either track.
    pub start_time: DateTime<Utc>,
    /// When the event was finalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Finalization duration in whole minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

impl AggregateEvent {
    /// Creates a new running aggregate for an event.
    #[must_use]
    pub fn new(event_id: EventId, expected_pr_count: usize, start_time: DateTime<Utc>) -> Self {
        Self {
            event_id,
            per_pr_result: BTreeMap::new(),
            total_result: None,
            current_status: AggregateStatus::Running,
            expected_pr_count,
            check_configured: true,
            start_time,
            end_time: None,
            duration_minutes: None,
        }
    }

    /// Marks the event as having no configured static check.
    #[must_use]
    pub fn without_check_info(mut self) -> Self {
        self.check_configured = false;
        self
    }

    /// Returns true once the aggregate is finalized.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.current_status == AggregateStatus::Done
    }

    /// Returns true once every expected PR has a combined result.
    #[must_use]
    pub fn all_prs_reported(&self) -> bool {
        self.expected_pr_count > 0 && self.per_pr_result.len() == self.expected_pr_count
    }
}

/// Replaces dots with the storage-safe escape token.
///
/// Document-store keys cannot contain dots; both tracks store per-PR maps
/// under this normalized form.
#[must_use]
pub fn normalize_pr_key(mr_url: &str) -> String {
    mr_url.replace('.', PR_KEY_DOT_ESCAPE)
}

/// Restores a raw PR URL from its storage-safe key.
///
/// Keys arrive URL-encoded, sometimes twice (the dot escape re-encodes the
/// percent sign), so decoding runs twice. Decode failures fall back to the
/// input unchanged; they are logged by callers and never abort the batch.
#[must_use]
pub fn decode_pr_key(key: &str) -> String {
    let once = match percent_decode_str(key).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(error) => {
            tracing::warn!(key, %error, "PR key is not valid UTF-8 after decoding");
            return key.to_string();
        }
    };
    match percent_decode_str(&once).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(error) => {
            tracing::warn!(key, %error, "PR key is not valid UTF-8 after second decoding");
            once
        }
    }
}

/// Derives the repository URL from a PR URL.
///
/// `https://host/org/repo/pulls/42` becomes `https://host/org/repo.git`.
/// Returns `None` for URLs without a pulls segment.
#[must_use]
pub fn repo_url_for(pr_url: &str) -> Option<String> {
    let prefix = pr_url.find(PULLS_SEGMENT)?;
    Some(format!("{}{REPO_URL_SUFFIX}", &pr_url[..prefix]))
}

/// Shard index for a defect write.
///
/// Shard assignment is a pure function of the numeric defect ID modulo the
/// shard count, so each write targets a disjoint shard with no cross-shard
/// coordination. Non-numeric IDs hash first.
#[must_use]
pub fn shard_for(defect_id: &str, shard_count: u64) -> u64 {
    let numeric = defect_id.parse::<u64>().unwrap_or_else(|_| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        defect_id.hash(&mut hasher);
        hasher.finish()
    });
    numeric % shard_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_and_decode_roundtrip() {
        let url = "https://gitee.com/acme/widget/pulls/42";
        let key = normalize_pr_key(url);
        assert!(!key.contains('.'));
        assert_eq!(decode_pr_key(&key), url);
    }

    #[test]
    fn decode_handles_double_encoding() {
        // The dot escape's percent sign itself re-encoded.
        let key = "https%3A//gitee%252ecom/acme/widget/pulls/42";
        assert_eq!(decode_pr_key(key), "https://gitee.com/acme/widget/pulls/42");
    }

    #[test]
    fn decode_falls_back_on_invalid_input() {
        let key = "%ff%fe";
        assert_eq!(decode_pr_key(key), key);
    }

    #[test]
    fn repo_url_truncates_at_pulls() {
        assert_eq!(
            repo_url_for("https://gitee.com/acme/widget/pulls/42"),
            Some("https://gitee.com/acme/widget.git".to_string())
        );
        assert_eq!(repo_url_for("https://gitee.com/acme/widget"), None);
    }

    #[test]
    fn shard_is_stable_and_bounded() {
        let a = shard_for("20117", 10);
        assert_eq!(a, 20117 % 10);
        assert_eq!(shard_for("20117", 10), a);
        assert!(shard_for("not-numeric", 10) < 10);
    }

    #[test]
    fn foss_hit_span() {
        let hit = FossHit {
            hit_start_line: 10,
            hit_end_line: 25,
        };
        assert_eq!(hit.span(), 15);
    }

    #[test]
    fn carry_curated_fields_preserves_reviewer_work() {
        let mut fresh = FossFragment {
            issue_key: "ik-1".into(),
            task_id: TaskId::new("t1"),
            event_id: EventId::new("e1"),
            defect_id: "7".into(),
            path: "src".into(),
            file_name: "lib.rs".into(),
            suffix: Some("rs".into()),
            confirmed: true,
            scan_results: Vec::new(),
            confirm_time: None,
            component_name: None,
            component_version: None,
            foss_type: None,
            remarks: None,
            open: None,
            owner_id: None,
            owner_name: None,
        };
        let previous = FossFragment {
            component_name: Some("zlib".into()),
            component_version: Some("1.3".into()),
            owner_name: Some("reviewer".into()),
            open: Some(true),
            ..fresh.clone()
        };

        fresh.carry_curated_fields(&previous);
        assert_eq!(fresh.component_name.as_deref(), Some("zlib"));
        assert_eq!(fresh.component_version.as_deref(), Some("1.3"));
        assert_eq!(fresh.owner_name.as_deref(), Some("reviewer"));
        assert_eq!(fresh.open, Some(true));
    }

    #[test]
    fn aggregate_reports_completion() {
        let mut aggregate = AggregateEvent::new(EventId::new("e1"), 2, Utc::now());
        assert!(!aggregate.all_prs_reported());

        aggregate
            .per_pr_result
            .insert("pr-a".into(), CheckResult::Pass);
        aggregate
            .per_pr_result
            .insert("pr-b".into(), CheckResult::NoPass);
        assert!(aggregate.all_prs_reported());
        assert!(!aggregate.is_done());
    }

    #[test]
    fn check_results_serialize_screaming_snake() {
        let json = serde_json::to_string(&CheckResult::NoPass).unwrap();
        assert_eq!(json, "\"NO_PASS\"");
        let json = serde_json::to_string(&CheckResult::TimeOut).unwrap();
        assert_eq!(json, "\"TIME_OUT\"");
    }
}
