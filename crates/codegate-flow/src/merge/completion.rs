//! Exactly-once finalization of aggregate events.

use chrono::{DateTime, Utc};

use crate::model::{AggregateEvent, AggregateStatus, CheckResult};

/// Gate status propagated to the external event record.
///
/// Distinct from the stored total: a `NoPass` rollup is persisted as a
/// `Failed` total while this status keeps the finer-grained verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeStatus {
    /// Every PR cleared the gate.
    Success,
    /// At least one PR found gating issues.
    NoPass,
    /// A check failed to run, hit an anomaly, or the event timed out.
    Failed,
    /// No check produced a verdict for any PR.
    NoCheck,
}

/// Result of a finalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Already finalized; nothing changed, timestamps untouched.
    AlreadyDone,
    /// Not every expected PR has a combined result yet.
    NotReady,
    /// Finalized on this invocation.
    Finalized {
        /// Event total per the result priority.
        total: CheckResult,
        /// Pass/fail rollup for the external event record.
        status: FinalizeStatus,
        /// Finalization timestamp.
        end_time: DateTime<Utc>,
    },
}

impl FinalizeOutcome {
    /// Returns true when this invocation performed the finalization.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized { .. })
    }
}

/// Decides when an aggregate is complete and transitions it to done.
///
/// Runs under the event mutex, after the merge wrote per-PR results. The
/// `Running -> Done` transition happens at most once per event; repeated
/// invocations after the transition are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionDetector;

impl CompletionDetector {
    /// Creates a detector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Finalizes the aggregate when every expected PR has reported.
    pub fn try_finalize(
        &self,
        aggregate: &mut AggregateEvent,
        now: DateTime<Utc>,
    ) -> FinalizeOutcome {
        if aggregate.is_done() {
            return FinalizeOutcome::AlreadyDone;
        }
        if !aggregate.all_prs_reported() {
            return FinalizeOutcome::NotReady;
        }

        let rollup = rollup_result(aggregate.per_pr_result.values().copied());
        finalize(aggregate, rollup, now)
    }

    /// Forces a timed-out aggregate to its terminal state.
    ///
    /// Used when the decision deadline elapsed; does not wait for missing
    /// PR results.
    pub fn force_timeout(
        &self,
        aggregate: &mut AggregateEvent,
        now: DateTime<Utc>,
    ) -> FinalizeOutcome {
        if aggregate.is_done() {
            return FinalizeOutcome::AlreadyDone;
        }
        finalize(aggregate, CheckResult::TimeOut, now)
    }
}

fn finalize(
    aggregate: &mut AggregateEvent,
    rollup: CheckResult,
    now: DateTime<Utc>,
) -> FinalizeOutcome {
    let (total, status) = stored_pair(rollup);

    aggregate.total_result = Some(total);
    aggregate.current_status = AggregateStatus::Done;
    aggregate.end_time = Some(now);
    aggregate.duration_minutes = Some((now - aggregate.start_time).num_minutes());

    tracing::info!(
        event_id = aggregate.event_id.as_str(),
        total = ?total,
        duration_minutes = aggregate.duration_minutes,
        "event finalized"
    );

    FinalizeOutcome::Finalized {
        total,
        status,
        end_time: now,
    }
}

/// Per-PR rollup by result priority.
///
/// `Failed` outranks everything and anomalies outrank plain non-passes. The
/// rollup is mapped to a stored total by [`stored_pair`].
fn rollup_result(results: impl Iterator<Item = CheckResult>) -> CheckResult {
    let mut rollup = CheckResult::NotConfigured;
    for result in results {
        if rank(result) > rank(rollup) {
            rollup = result;
        }
    }
    rollup
}

/// Maps the per-PR rollup to the persisted total and the propagated status.
///
/// A `NoPass` rollup persists as a `Failed` total while the status keeps
/// `NoPass`; only not-configured results persist as a `Pass` total with a
/// `NoCheck` status.
const fn stored_pair(rollup: CheckResult) -> (CheckResult, FinalizeStatus) {
    match rollup {
        CheckResult::Failed | CheckResult::Error | CheckResult::TimeOut => {
            (rollup, FinalizeStatus::Failed)
        }
        CheckResult::NoPass => (CheckResult::Failed, FinalizeStatus::NoPass),
        CheckResult::Pass => (CheckResult::Pass, FinalizeStatus::Success),
        CheckResult::NotConfigured => (CheckResult::Pass, FinalizeStatus::NoCheck),
    }
}

const fn rank(result: CheckResult) -> u8 {
    match result {
        CheckResult::Failed => 5,
        CheckResult::Error => 4,
        CheckResult::NoPass => 3,
        CheckResult::TimeOut => 2,
        CheckResult::Pass => 1,
        CheckResult::NotConfigured => 0,
    }
}
