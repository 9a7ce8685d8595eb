//! Recombines both tracks' per-PR verdicts into the aggregate event.
//!
//! The merge is re-executed whole each poll rather than incrementally
//! accumulated; re-running it on unchanged inputs produces an identical
//! aggregate and no additional side effects. Callers hold the event mutex
//! for the full merge.

pub mod completion;

use std::sync::Arc;

use chrono::Utc;

use codegate_core::id::EventId;

use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::merge::completion::{CompletionDetector, FinalizeOutcome};
use crate::model::{
    decode_pr_key, normalize_pr_key, repo_url_for, CheckResult, CheckStatus, CheckSummary,
    InnerSnapshot, SubCheckResult,
};
use crate::store::{EventStore, SummaryStore};

/// Result of one merge pass over an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The aggregate was already finalized; nothing was touched.
    AlreadyDone,
    /// Results were merged but not every expected PR has reported.
    StillRunning,
    /// Every expected PR reported and the aggregate was finalized.
    Finalized {
        /// Event total per the result priority.
        total: CheckResult,
    },
    /// The decision deadline elapsed; the aggregate was forced to a
    /// timeout verdict.
    TimedOut,
}

/// Merges the inner snapshot and outside summaries into the aggregate.
pub struct MergeEngine {
    config: ReconcilerConfig,
    events: Arc<dyn EventStore>,
    summaries: Arc<dyn SummaryStore>,
    detector: CompletionDetector,
}

impl MergeEngine {
    /// Creates an engine over the given stores.
    #[must_use]
    pub fn new(
        config: ReconcilerConfig,
        events: Arc<dyn EventStore>,
        summaries: Arc<dyn SummaryStore>,
    ) -> Self {
        Self {
            config,
            events,
            summaries,
            detector: CompletionDetector::new(),
        }
    }

    /// Runs one merge pass for an event. The caller holds the event mutex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AggregateNotFound`] for an unknown event, or a
    /// storage error from the backing stores.
    pub async fn merge_event(&self, event_id: &EventId) -> Result<MergeOutcome> {
        let Some(mut aggregate) = self.events.aggregate(event_id).await? else {
            return Err(Error::AggregateNotFound {
                event_id: event_id.clone(),
            });
        };
        if aggregate.is_done() {
            return Ok(MergeOutcome::AlreadyDone);
        }

        let snapshot = self.events.inner_snapshot(event_id).await?;
        let summaries = self.summaries.summaries_for_event(event_id).await?;

        if aggregate.check_configured {
            self.merge_dual_track(&mut aggregate, snapshot.as_ref(), &summaries);
        } else {
            // No check was ever configured for this event; the inner track
            // is not applicable and the outside track decides alone.
            merge_outside_only(&mut aggregate, &summaries);
        }

        let now = Utc::now();

        // The timeout clock starts at the later of event start and the
        // inner track entering its running phase.
        let reference = snapshot
            .as_ref()
            .and_then(|s| s.running_at)
            .map_or(aggregate.start_time, |running| {
                running.max(aggregate.start_time)
            });
        if now - reference > self.config.total_timeout {
            let outcome = self.detector.force_timeout(&mut aggregate, now);
            self.events.put_aggregate(aggregate).await?;
            return Ok(match outcome {
                FinalizeOutcome::AlreadyDone => MergeOutcome::AlreadyDone,
                _ => MergeOutcome::TimedOut,
            });
        }

        let outcome = self.detector.try_finalize(&mut aggregate, now);
        self.events.put_aggregate(aggregate).await?;
        Ok(match outcome {
            FinalizeOutcome::AlreadyDone => MergeOutcome::AlreadyDone,
            FinalizeOutcome::NotReady => MergeOutcome::StillRunning,
            FinalizeOutcome::Finalized { total, .. } => MergeOutcome::Finalized { total },
        })
    }

    fn merge_dual_track(
        &self,
        aggregate: &mut crate::model::AggregateEvent,
        snapshot: Option<&InnerSnapshot>,
        summaries: &[CheckSummary],
    ) {
        let Some(snapshot) = snapshot else {
            // Inner track has not reported at all yet; wait for it (or the
            // timeout) rather than deciding on half the inputs.
            return;
        };

        if snapshot.total_result.is_none() {
            // The inner track still reports itself running; its sub-check
            // lists may be partial, so write nothing back this cycle.
            return;
        }

        if snapshot.sub_checks.is_empty() && aggregate.expected_pr_count > 0 {
            // Data anomaly: results were expected but the snapshot carries
            // none. Escalate per PR instead of passing silently.
            for summary in summaries {
                let decoded = decode_pr_key(&summary.mr_url);
                if self.config.pr_key_denied(&decoded) {
                    continue;
                }
                let inner = if self.inner_tracked(&decoded) {
                    CheckResult::Error
                } else {
                    CheckResult::Pass
                };
                let combined = combine(outside_result(summary), inner);
                aggregate
                    .per_pr_result
                    .insert(normalize_pr_key(&decoded), combined);
            }
            return;
        }

        for (key, sub_checks) in &snapshot.sub_checks {
            let decoded = decode_pr_key(key);
            if self.config.pr_key_denied(&decoded) {
                continue;
            }

            let inner = if self.inner_tracked(&decoded) {
                inner_result(sub_checks)
            } else {
                CheckResult::Pass
            };

            let Some(summary) = find_summary(summaries, &decoded) else {
                // Outside track has not reported this PR yet; revisit next
                // poll.
                continue;
            };

            let combined = combine(outside_result(summary), inner);
            aggregate
                .per_pr_result
                .insert(normalize_pr_key(&decoded), combined);
        }
    }

    fn inner_tracked(&self, decoded_pr_url: &str) -> bool {
        repo_url_for(decoded_pr_url)
            .is_some_and(|repo| self.config.repo_eligible(&repo))
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine").finish_non_exhaustive()
    }
}

fn merge_outside_only(aggregate: &mut crate::model::AggregateEvent, summaries: &[CheckSummary]) {
    for summary in summaries {
        let decoded = decode_pr_key(&summary.mr_url);
        aggregate
            .per_pr_result
            .insert(normalize_pr_key(&decoded), outside_result(summary));
    }
}

fn find_summary<'a>(summaries: &'a [CheckSummary], decoded_pr_url: &str) -> Option<&'a CheckSummary> {
    summaries
        .iter()
        .find(|summary| decode_pr_key(&summary.mr_url) == decoded_pr_url)
}

/// Inner per-PR result from its sub-check list.
///
/// Advisory `Warning` entries are ignored; the rest must be uniformly
/// passing.
fn inner_result(sub_checks: &[crate::model::SubCheck]) -> CheckResult {
    let mut gating = sub_checks
        .iter()
        .filter(|check| check.result != SubCheckResult::Warning)
        .peekable();
    if gating.peek().is_none() {
        return CheckResult::NoPass;
    }
    if gating.all(|check| check.result == SubCheckResult::Pass) {
        CheckResult::Pass
    } else {
        CheckResult::NoPass
    }
}

/// Outside per-PR result from its summary.
fn outside_result(summary: &CheckSummary) -> CheckResult {
    if summary.status == CheckStatus::NoCheck || summary.result == CheckResult::NotConfigured {
        CheckResult::Pass
    } else {
        summary.result
    }
}

/// Combines the two tracks' verdicts for one PR.
///
/// The outside track's non-pass dominates, an anomaly under an outside
/// pass escalates, everything else defers to the inner track.
const fn combine(outside: CheckResult, inner: CheckResult) -> CheckResult {
    match (outside, inner) {
        (CheckResult::Pass, CheckResult::Pass) => CheckResult::Pass,
        (CheckResult::NoPass, _) => CheckResult::NoPass,
        (CheckResult::Pass, CheckResult::Error) => CheckResult::Error,
        (_, inner) => inner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use codegate_core::id::TaskId;

    use crate::model::{AggregateEvent, SubCheck};
    use crate::store::memory::InMemoryStores;

    const TRACKED_PR: &str = "https://gitee.com/acme/widget/pulls/1";
    const OTHER_PR: &str = "https://mirror.example/vendor/widget/pulls/2";

    fn sub(name: &str, result: SubCheckResult) -> SubCheck {
        SubCheck {
            name: name.to_string(),
            result,
        }
    }

    fn summary(event: &EventId, mr_url: &str, result: CheckResult) -> CheckSummary {
        CheckSummary {
            event_id: event.clone(),
            task_id: TaskId::new("t1"),
            mr_url: mr_url.to_string(),
            issue_count: i64::from(result == CheckResult::NoPass),
            solve_count: 0,
            result,
            status: match result {
                CheckResult::NotConfigured => CheckStatus::NoCheck,
                CheckResult::Failed | CheckResult::Error => CheckStatus::Failed,
                _ => CheckStatus::Success,
            },
        }
    }

    fn snapshot(event: &EventId, entries: &[(&str, Vec<SubCheck>)]) -> InnerSnapshot {
        let mut sub_checks = BTreeMap::new();
        for (key, checks) in entries {
            sub_checks.insert(normalize_pr_key(key), checks.clone());
        }
        InnerSnapshot {
            event_id: event.clone(),
            sub_checks,
            total_result: Some(CheckResult::Pass),
            running_at: Some(Utc::now()),
            updated_at: Utc::now(),
        }
    }

    fn tracked_config() -> ReconcilerConfig {
        ReconcilerConfig {
            repo_allow_list: vec!["https://gitee.com/acme/widget.git".to_string()],
            ..ReconcilerConfig::default()
        }
    }

    fn engine_with(config: ReconcilerConfig, stores: Arc<InMemoryStores>) -> MergeEngine {
        MergeEngine::new(config, stores.clone(), stores)
    }

    #[tokio::test]
    async fn scenario_two_prs_one_tracked_one_outside_no_pass() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 2, Utc::now()))
            .await
            .unwrap();
        stores
            .put_inner_snapshot(snapshot(
                &event,
                &[
                    (
                        TRACKED_PR,
                        vec![sub("lint", SubCheckResult::Pass), sub("build", SubCheckResult::Pass)],
                    ),
                    (OTHER_PR, vec![sub("lint", SubCheckResult::Pass)]),
                ],
            ))
            .await
            .unwrap();
        stores
            .put_summary(summary(&event, TRACKED_PR, CheckResult::Pass))
            .await
            .unwrap();
        stores
            .put_summary(summary(&event, OTHER_PR, CheckResult::NoPass))
            .await
            .unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        let outcome = engine.merge_event(&event).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Finalized {
                total: CheckResult::Failed
            }
        );

        let aggregate = stores.aggregate(&event).await.unwrap().unwrap();
        assert!(aggregate.is_done());
        assert_eq!(aggregate.total_result, Some(CheckResult::Failed));
        assert_eq!(
            aggregate.per_pr_result.get(&normalize_pr_key(TRACKED_PR)),
            Some(&CheckResult::Pass)
        );
        assert_eq!(
            aggregate.per_pr_result.get(&normalize_pr_key(OTHER_PR)),
            Some(&CheckResult::NoPass)
        );
    }

    #[tokio::test]
    async fn scenario_outside_only_pass() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        stores
            .put_aggregate(
                AggregateEvent::new(event.clone(), 1, Utc::now()).without_check_info(),
            )
            .await
            .unwrap();
        stores
            .put_summary(summary(&event, TRACKED_PR, CheckResult::Pass))
            .await
            .unwrap();

        let engine = engine_with(ReconcilerConfig::default(), stores.clone());
        let outcome = engine.merge_event(&event).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Finalized {
                total: CheckResult::Pass
            }
        );
    }

    #[tokio::test]
    async fn merge_is_idempotent_on_unchanged_inputs() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 2, Utc::now()))
            .await
            .unwrap();
        stores
            .put_inner_snapshot(snapshot(
                &event,
                &[(TRACKED_PR, vec![sub("lint", SubCheckResult::Pass)])],
            ))
            .await
            .unwrap();
        stores
            .put_summary(summary(&event, TRACKED_PR, CheckResult::Pass))
            .await
            .unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        assert_eq!(
            engine.merge_event(&event).await.unwrap(),
            MergeOutcome::StillRunning
        );
        let first = stores.aggregate(&event).await.unwrap().unwrap();

        assert_eq!(
            engine.merge_event(&event).await.unwrap(),
            MergeOutcome::StillRunning
        );
        let second = stores.aggregate(&event).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn warnings_are_ignored_but_failures_gate() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 1, Utc::now()))
            .await
            .unwrap();
        stores
            .put_inner_snapshot(snapshot(
                &event,
                &[(
                    TRACKED_PR,
                    vec![
                        sub("lint", SubCheckResult::Pass),
                        sub("style", SubCheckResult::Warning),
                        sub("build", SubCheckResult::Failed),
                    ],
                )],
            ))
            .await
            .unwrap();
        stores
            .put_summary(summary(&event, TRACKED_PR, CheckResult::Pass))
            .await
            .unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        let outcome = engine.merge_event(&event).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Finalized {
                total: CheckResult::Failed
            }
        );
    }

    #[tokio::test]
    async fn running_inner_total_defers_the_merge() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 1, Utc::now()))
            .await
            .unwrap();
        let mut running = snapshot(
            &event,
            &[(TRACKED_PR, vec![sub("lint", SubCheckResult::Pass)])],
        );
        running.total_result = None;
        stores.put_inner_snapshot(running).await.unwrap();
        stores
            .put_summary(summary(&event, TRACKED_PR, CheckResult::Pass))
            .await
            .unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        assert_eq!(
            engine.merge_event(&event).await.unwrap(),
            MergeOutcome::StillRunning
        );

        // Nothing is written back while the inner track is running.
        let aggregate = stores.aggregate(&event).await.unwrap().unwrap();
        assert!(aggregate.per_pr_result.is_empty());
    }

    #[tokio::test]
    async fn empty_snapshot_with_expected_results_escalates() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 1, Utc::now()))
            .await
            .unwrap();
        stores
            .put_inner_snapshot(snapshot(&event, &[]))
            .await
            .unwrap();
        stores
            .put_summary(summary(&event, TRACKED_PR, CheckResult::Pass))
            .await
            .unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        let outcome = engine.merge_event(&event).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Finalized {
                total: CheckResult::Error
            }
        );
    }

    #[tokio::test]
    async fn timed_out_event_is_forced_to_time_out() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        let started = Utc::now() - chrono::Duration::minutes(45);
        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 3, started))
            .await
            .unwrap();

        let mut old_snapshot = snapshot(
            &event,
            &[(TRACKED_PR, vec![sub("lint", SubCheckResult::Pass)])],
        );
        old_snapshot.running_at = Some(started);
        stores.put_inner_snapshot(old_snapshot).await.unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        let outcome = engine.merge_event(&event).await.unwrap();
        assert_eq!(outcome, MergeOutcome::TimedOut);

        let aggregate = stores.aggregate(&event).await.unwrap().unwrap();
        assert_eq!(aggregate.total_result, Some(CheckResult::TimeOut));
        assert!(aggregate.is_done());
    }

    #[tokio::test]
    async fn done_event_short_circuits() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        let mut aggregate = AggregateEvent::new(event.clone(), 1, Utc::now());
        aggregate
            .per_pr_result
            .insert(normalize_pr_key(TRACKED_PR), CheckResult::Pass);
        CompletionDetector::new().try_finalize(&mut aggregate, Utc::now());
        stores.put_aggregate(aggregate).await.unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        assert_eq!(
            engine.merge_event(&event).await.unwrap(),
            MergeOutcome::AlreadyDone
        );
    }

    #[tokio::test]
    async fn unknown_event_is_an_error() {
        let stores = Arc::new(InMemoryStores::new());
        let engine = engine_with(ReconcilerConfig::default(), stores);
        let error = engine.merge_event(&EventId::new("missing")).await.unwrap_err();
        assert!(matches!(error, Error::AggregateNotFound { .. }));
    }

    #[tokio::test]
    async fn untracked_repo_defers_to_outside() {
        let stores = Arc::new(InMemoryStores::new());
        let event = EventId::new("e1");

        stores
            .put_aggregate(AggregateEvent::new(event.clone(), 1, Utc::now()))
            .await
            .unwrap();
        // Inner reports a failure, but the repo is outside the allow-list.
        stores
            .put_inner_snapshot(snapshot(
                &event,
                &[(OTHER_PR, vec![sub("lint", SubCheckResult::Failed)])],
            ))
            .await
            .unwrap();
        stores
            .put_summary(summary(&event, OTHER_PR, CheckResult::Pass))
            .await
            .unwrap();

        let engine = engine_with(tracked_config(), stores.clone());
        let outcome = engine.merge_event(&event).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Finalized {
                total: CheckResult::Pass
            }
        );
    }
}
