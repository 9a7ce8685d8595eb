//! HTTP implementation of [`CheckBackend`].
//!
//! Talks JSON to the check service with connect and request timeouts and a
//! bounded retry for transient status codes. Timeouts fail fast instead of
//! retrying so a slow backend cannot wedge a poll cycle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use codegate_core::id::TaskId;

use crate::client::{CheckBackend, DetailPage, SeverityFilter, SummaryPayload, TaskProgress};
use crate::error::{Error, Result};

const MAX_ATTEMPTS: usize = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 500;

/// [`CheckBackend`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCheckBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCheckBackend {
    /// Builds a backend client for the given service base URL.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the URL does not parse or the
    /// HTTP client cannot be constructed.
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| Error::configuration(format!("invalid check backend URL: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// GET with bounded retry on transient status codes.
    ///
    /// 404 means "not there yet" for summaries and "past the end" for detail
    /// pages, so it maps to `Ok(None)` rather than an error.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let response = self
                .client
                .get(url)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(resp) if resp.status().is_success() => {
                    let payload = resp.json::<T>().await.map_err(|e| {
                        Error::fetch(format!("malformed response from {url}: {e}"))
                    })?;
                    return Ok(Some(payload));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retryable = status.as_u16() == 409
                        || status.as_u16() == 429
                        || status.is_server_error();

                    if retryable && attempt < MAX_ATTEMPTS {
                        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                        let backoff_ms = BACKOFF_BASE_MS
                            .saturating_mul(2_u64.saturating_pow(exponent))
                            .min(BACKOFF_CAP_MS);
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::fetch(format!(
                        "check backend request failed (status={status}): {body}"
                    )));
                }
                Err(err) => {
                    // Don't retry timeouts: failing fast avoids wedging the
                    // poll cycle.
                    if err.is_timeout() {
                        return Err(Error::fetch(format!(
                            "check backend request timed out: {err}"
                        )));
                    }

                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS)).await;
                        continue;
                    }

                    return Err(Error::fetch_with_source(
                        format!("check backend request failed: {err}"),
                        err,
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl CheckBackend for HttpCheckBackend {
    async fn task_progress(&self, task_id: &TaskId, region: &str) -> Result<TaskProgress> {
        let url = format!(
            "{}/tasks/{task_id}/progress?region={region}",
            self.base_url
        );
        self.get_json::<TaskProgress>(&url)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    async fn task_summary(
        &self,
        task_id: &TaskId,
        region: &str,
    ) -> Result<Option<SummaryPayload>> {
        let url = format!("{}/tasks/{task_id}/summary?region={region}", self.base_url);
        self.get_json(&url).await
    }

    async fn task_details(
        &self,
        task_id: &TaskId,
        offset: u64,
        limit: u32,
        region: &str,
        filter: SeverityFilter,
    ) -> Result<Option<DetailPage>> {
        let url = format!(
            "{}/tasks/{task_id}/defects?offset={offset}&limit={limit}&region={region}&severity={}",
            self.base_url,
            filter.as_query()
        );
        self.get_json(&url).await
    }
}
