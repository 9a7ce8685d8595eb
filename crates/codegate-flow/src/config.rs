//! Runtime configuration for the reconciliation engine.
//!
//! All tunables load from the process environment with strict validation and
//! safe defaults, so a bare deployment behaves identically to the reference
//! settings.

use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::error::{Error, Result};

const ENV_POLLING_WINDOW_MINS: &str = "CODEGATE_POLLING_WINDOW_MINS";
const ENV_TOTAL_TIMEOUT_MINS: &str = "CODEGATE_TOTAL_TIMEOUT_MINS";
const ENV_STALENESS_MINS: &str = "CODEGATE_STALENESS_MINS";
const ENV_PAGE_SIZE: &str = "CODEGATE_PAGE_SIZE";
const ENV_LARGE_RESULT_THRESHOLD: &str = "CODEGATE_LARGE_RESULT_THRESHOLD";
const ENV_EVENT_POOL_SIZE: &str = "CODEGATE_EVENT_POOL_SIZE";
const ENV_PAGE_POOL_SIZE: &str = "CODEGATE_PAGE_POOL_SIZE";
const ENV_DRAIN_POOL_SIZE: &str = "CODEGATE_DRAIN_POOL_SIZE";
const ENV_LOCK_TTL_SECS: &str = "CODEGATE_LOCK_TTL_SECS";
const ENV_LOCK_WAIT_BUDGET_SECS: &str = "CODEGATE_LOCK_WAIT_BUDGET_SECS";
const ENV_DEFECT_SHARD_COUNT: &str = "CODEGATE_DEFECT_SHARD_COUNT";
const ENV_REPO_ALLOW_LIST: &str = "CODEGATE_REPO_ALLOW_LIST";
const ENV_REPO_DENY_LIST: &str = "CODEGATE_REPO_DENY_LIST";
const ENV_PR_KEY_DENY_PREFIXES: &str = "CODEGATE_PR_KEY_DENY_PREFIXES";
const ENV_REGION: &str = "CODEGATE_REGION";

const DEFAULT_POLLING_WINDOW_MINS: u64 = 36;
const DEFAULT_TOTAL_TIMEOUT_MINS: u64 = 30;
const DEFAULT_STALENESS_MINS: u64 = 60;
const DEFAULT_PAGE_SIZE: u64 = 100;
const DEFAULT_LARGE_RESULT_THRESHOLD: u64 = 10_000;
const DEFAULT_EVENT_POOL_SIZE: u64 = 8;
const DEFAULT_PAGE_POOL_SIZE: u64 = 16;
const DEFAULT_DRAIN_POOL_SIZE: u64 = 8;
const DEFAULT_LOCK_TTL_SECS: u64 = 120;
const DEFAULT_LOCK_WAIT_BUDGET_SECS: u64 = 10;
const DEFAULT_DEFECT_SHARD_COUNT: u64 = 10;
const DEFAULT_REGION: &str = "default";

/// Tunables governing polling cadence, timeouts, pagination, concurrency
/// limits, and repository filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Look-back window when selecting recently started events to poll.
    pub polling_window: Duration,
    /// Deadline after which a still-running event is forced to a timeout
    /// verdict.
    pub total_timeout: Duration,
    /// Age after which a task's event is considered stale during drain.
    pub staleness: Duration,
    /// Detail fetch page size.
    pub page_size: u32,
    /// Defect count at which the detail fetch splits into per-severity
    /// passes and the solved count is stored negated.
    pub large_result_threshold: u64,
    /// Concurrent event reconciliations per poll cycle.
    pub event_pool_size: usize,
    /// Concurrent detail page fetches per task.
    pub page_pool_size: usize,
    /// Concurrent task syncs during a pending-task drain.
    pub drain_pool_size: usize,
    /// Time-to-live of the per-event lock entry.
    pub lock_ttl: StdDuration,
    /// Total time a reconciliation waits for the per-event lock before
    /// giving up for this cycle.
    pub lock_wait_budget: StdDuration,
    /// Number of defect shards.
    pub defect_shard_count: u64,
    /// Repositories eligible for reconciliation. Empty means all.
    pub repo_allow_list: Vec<String>,
    /// Repositories excluded from reconciliation.
    pub repo_deny_list: Vec<String>,
    /// PR key prefixes excluded from per-PR merging.
    pub pr_key_deny_prefixes: Vec<String>,
    /// Deployment region sent with every check backend fetch.
    pub region: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            polling_window: Duration::minutes(i64::try_from(DEFAULT_POLLING_WINDOW_MINS).unwrap_or(36)),
            total_timeout: Duration::minutes(i64::try_from(DEFAULT_TOTAL_TIMEOUT_MINS).unwrap_or(30)),
            staleness: Duration::minutes(i64::try_from(DEFAULT_STALENESS_MINS).unwrap_or(60)),
            page_size: u32::try_from(DEFAULT_PAGE_SIZE).unwrap_or(100),
            large_result_threshold: DEFAULT_LARGE_RESULT_THRESHOLD,
            event_pool_size: usize::try_from(DEFAULT_EVENT_POOL_SIZE).unwrap_or(8),
            page_pool_size: usize::try_from(DEFAULT_PAGE_POOL_SIZE).unwrap_or(16),
            drain_pool_size: usize::try_from(DEFAULT_DRAIN_POOL_SIZE).unwrap_or(8),
            lock_ttl: StdDuration::from_secs(DEFAULT_LOCK_TTL_SECS),
            lock_wait_budget: StdDuration::from_secs(DEFAULT_LOCK_WAIT_BUDGET_SECS),
            defect_shard_count: DEFAULT_DEFECT_SHARD_COUNT,
            repo_allow_list: Vec::new(),
            repo_deny_list: Vec::new(),
            pr_key_deny_prefixes: Vec::new(),
            region: DEFAULT_REGION.to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer
    /// or exceeds the supported range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer
    /// or exceeds the supported range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let polling_window_mins = parse_positive_u64_env(
            &get_env,
            ENV_POLLING_WINDOW_MINS,
            DEFAULT_POLLING_WINDOW_MINS,
        )?;
        let total_timeout_mins =
            parse_positive_u64_env(&get_env, ENV_TOTAL_TIMEOUT_MINS, DEFAULT_TOTAL_TIMEOUT_MINS)?;
        let staleness_mins =
            parse_positive_u64_env(&get_env, ENV_STALENESS_MINS, DEFAULT_STALENESS_MINS)?;
        let page_size = parse_positive_u64_env(&get_env, ENV_PAGE_SIZE, DEFAULT_PAGE_SIZE)?;
        let large_result_threshold = parse_positive_u64_env(
            &get_env,
            ENV_LARGE_RESULT_THRESHOLD,
            DEFAULT_LARGE_RESULT_THRESHOLD,
        )?;
        let event_pool_size =
            parse_positive_u64_env(&get_env, ENV_EVENT_POOL_SIZE, DEFAULT_EVENT_POOL_SIZE)?;
        let page_pool_size =
            parse_positive_u64_env(&get_env, ENV_PAGE_POOL_SIZE, DEFAULT_PAGE_POOL_SIZE)?;
        let drain_pool_size =
            parse_positive_u64_env(&get_env, ENV_DRAIN_POOL_SIZE, DEFAULT_DRAIN_POOL_SIZE)?;
        let lock_ttl_secs =
            parse_positive_u64_env(&get_env, ENV_LOCK_TTL_SECS, DEFAULT_LOCK_TTL_SECS)?;
        let lock_wait_budget_secs = parse_positive_u64_env(
            &get_env,
            ENV_LOCK_WAIT_BUDGET_SECS,
            DEFAULT_LOCK_WAIT_BUDGET_SECS,
        )?;
        let defect_shard_count =
            parse_positive_u64_env(&get_env, ENV_DEFECT_SHARD_COUNT, DEFAULT_DEFECT_SHARD_COUNT)?;

        let page_size = u32::try_from(page_size).map_err(|_| {
            Error::configuration(format!(
                "{ENV_PAGE_SIZE} value {page_size} exceeds supported range"
            ))
        })?;

        Ok(Self {
            polling_window: minutes_duration(ENV_POLLING_WINDOW_MINS, polling_window_mins)?,
            total_timeout: minutes_duration(ENV_TOTAL_TIMEOUT_MINS, total_timeout_mins)?,
            staleness: minutes_duration(ENV_STALENESS_MINS, staleness_mins)?,
            page_size,
            large_result_threshold,
            event_pool_size: usize::try_from(event_pool_size).unwrap_or(usize::MAX),
            page_pool_size: usize::try_from(page_pool_size).unwrap_or(usize::MAX),
            drain_pool_size: usize::try_from(drain_pool_size).unwrap_or(usize::MAX),
            lock_ttl: StdDuration::from_secs(lock_ttl_secs),
            lock_wait_budget: StdDuration::from_secs(lock_wait_budget_secs),
            defect_shard_count,
            repo_allow_list: parse_list_env(&get_env, ENV_REPO_ALLOW_LIST),
            repo_deny_list: parse_list_env(&get_env, ENV_REPO_DENY_LIST),
            pr_key_deny_prefixes: parse_list_env(&get_env, ENV_PR_KEY_DENY_PREFIXES),
            region: get_env(ENV_REGION).unwrap_or_else(|| DEFAULT_REGION.to_string()),
        })
    }

    /// Whether a repository URL is eligible for reconciliation.
    #[must_use]
    pub fn repo_eligible(&self, repo_url: &str) -> bool {
        if self.repo_deny_list.iter().any(|denied| denied == repo_url) {
            return false;
        }
        self.repo_allow_list.is_empty()
            || self.repo_allow_list.iter().any(|allowed| allowed == repo_url)
    }

    /// Whether a decoded PR key should be skipped during merging.
    #[must_use]
    pub fn pr_key_denied(&self, pr_key: &str) -> bool {
        self.pr_key_deny_prefixes
            .iter()
            .any(|prefix| pr_key.starts_with(prefix.as_str()))
    }
}

fn minutes_duration(key: &str, minutes: u64) -> Result<Duration> {
    let minutes = i64::try_from(minutes).map_err(|_| {
        Error::configuration(format!("{key} value {minutes} exceeds supported range"))
    })?;
    Ok(Duration::minutes(minutes))
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_list_env<F>(get_env: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    get_env(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
