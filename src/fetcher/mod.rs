//! Retrying HTTP fetcher
//!
//! A [`Fetcher`] performs one logical fetch as a bounded sequence of HTTP
//! attempts. After each attempt the [`RetryPolicy`] decides whether to go again
//! and the [`Backoff`] decides how long to wait first. Cancellation of the
//! caller's token wins at every point: before a request is sent, while it is in
//! flight, while the body is read and during the backoff sleep.
//!
//! Per-task failures are never returned as `Err`. They are reported through
//! [`FetchResponse::outcome`] so the caller can record them on the task.

pub mod policy;

pub use policy::{
    AttemptResult, Backoff, DefaultRetryPolicy, ExponentialBackoff, JitteredBackoff,
    RetryDecision, RetryPolicy, exponential_delay, retry_after,
};

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::types::{FetchOutcome, TaskId};

/// Maximum number of body bytes kept as the content snippet
pub const READ_LIMIT: usize = 128;

/// Default lower bound of the backoff wait
pub const DEFAULT_RETRY_WAIT_MIN: Duration = Duration::from_millis(50);

/// Default upper bound of the backoff wait
pub const DEFAULT_RETRY_WAIT_MAX: Duration = Duration::from_secs(5);

/// Build the pooled HTTP client shared by every fetcher
pub fn build_client(config: &HttpConfig) -> Result<Client> {
    let client = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(config.user_agent.clone())
        .build()?;
    Ok(client)
}

/// One logical fetch
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Task being fetched, used for logging
    pub id: TaskId,
    /// HTTP method
    pub method: Method,
    /// Target URL
    pub url: String,
    /// Lower bound handed to the backoff policy
    pub retry_wait_min: Duration,
    /// Upper bound handed to the backoff policy
    pub retry_wait_max: Duration,
    /// Total number of attempts allowed
    pub max_retries: u32,
}

impl FetchRequest {
    /// A GET request with the default backoff bounds
    pub fn get(id: impl Into<TaskId>, url: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: id.into(),
            method: Method::GET,
            url: url.into(),
            retry_wait_min: DEFAULT_RETRY_WAIT_MIN,
            retry_wait_max: DEFAULT_RETRY_WAIT_MAX,
            max_retries,
        }
    }

    /// Override the backoff bounds
    pub fn with_retry_wait(mut self, min: Duration, max: Duration) -> Self {
        self.retry_wait_min = min;
        self.retry_wait_max = max;
        self
    }
}

/// Result of a logical fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Task that was fetched
    pub id: TaskId,
    /// Last HTTP status observed, 0 if no response was received
    pub status_code: u16,
    /// Up to [`READ_LIMIT`] bytes of the final body, or the routing sentinel
    ///
    /// Never ends in a partial character. Invalid UTF-8 is decoded lossily.
    pub content: String,
    /// Length declared by the last response
    pub content_length: Option<u64>,
    /// Attempts consumed
    pub retries: u32,
    /// How the fetch ended
    pub outcome: FetchOutcome,
}

impl FetchResponse {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            status_code: 0,
            content: String::new(),
            content_length: None,
            retries: 0,
            outcome: FetchOutcome::Response,
        }
    }

    fn finish(mut self, outcome: FetchOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// The error equivalent of a non-response outcome, for reporting
    pub fn error(&self) -> Option<Error> {
        match &self.outcome {
            FetchOutcome::Response => None,
            FetchOutcome::Failed { reason } => Some(Error::Fetch {
                id: self.id.to_string(),
                reason: reason.clone(),
            }),
            FetchOutcome::Exhausted => Some(Error::ExhaustedAttempts {
                id: self.id.to_string(),
                status_code: self.status_code,
            }),
            FetchOutcome::Cancelled => Some(Error::Cancelled),
        }
    }
}

/// HTTP fetcher with pluggable retry and backoff policies
///
/// Cloning is cheap: the client's connection pool and both policies are shared.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff: Arc<dyn Backoff>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher").finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Fetcher using [`DefaultRetryPolicy`] and [`ExponentialBackoff`]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry_policy: Arc::new(DefaultRetryPolicy),
            backoff: Arc::new(ExponentialBackoff),
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Replace the backoff policy
    pub fn with_backoff<B: Backoff + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Run a logical fetch to completion
    pub async fn get(&self, cancel: &CancellationToken, req: &FetchRequest) -> FetchResponse {
        let mut resp = FetchResponse::new(req.id.clone());

        let url = match Url::parse(&req.url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(task_id = %req.id, url = %req.url, error = %e, "invalid url");
                let reason = Error::InvalidUrl(e).to_string();
                return resp.finish(FetchOutcome::Failed { reason });
            }
        };

        for attempt in 1..=req.max_retries {
            if cancel.is_cancelled() {
                return resp.finish(FetchOutcome::Cancelled);
            }
            resp.retries = attempt;

            tracing::info!(task_id = %req.id, attempt, url = %url, "starting fetch attempt");

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return resp.finish(FetchOutcome::Cancelled),
                sent = self.client.request(req.method.clone(), url.clone()).send() => sent,
            };
            let last_attempt = attempt == req.max_retries;

            match sent {
                Ok(response) => {
                    resp.status_code = response.status().as_u16();
                    resp.content_length = response.content_length();

                    let (decision, wait) = {
                        let result = AttemptResult::Response {
                            status: response.status(),
                            headers: response.headers(),
                        };
                        let decision = self.retry_policy.check(cancel, &result);
                        let wait = match decision {
                            RetryDecision::Retry if !last_attempt => self.backoff.delay(
                                req.retry_wait_min,
                                req.retry_wait_max,
                                attempt,
                                &result,
                            ),
                            _ => Duration::ZERO,
                        };
                        (decision, wait)
                    };

                    match decision {
                        RetryDecision::Cancelled => return resp.finish(FetchOutcome::Cancelled),
                        RetryDecision::Retry if !last_attempt => {
                            // Drain so the connection goes back to the pool
                            if let Ok(None) = read_snippet(cancel, response).await {
                                return resp.finish(FetchOutcome::Cancelled);
                            }
                            if !backoff_sleep(cancel, &req.id, attempt, wait).await {
                                return resp.finish(FetchOutcome::Cancelled);
                            }
                        }
                        decision => {
                            let outcome = match decision {
                                RetryDecision::Stop => FetchOutcome::Response,
                                _ => FetchOutcome::Exhausted,
                            };
                            tracing::info!(
                                task_id = %req.id,
                                attempt,
                                status = resp.status_code,
                                outcome = %outcome,
                                "stopped fetching"
                            );
                            return match read_snippet(cancel, response).await {
                                Ok(Some(content)) => {
                                    resp.content = content;
                                    resp.finish(outcome)
                                }
                                Ok(None) => resp.finish(FetchOutcome::Cancelled),
                                Err(e) => {
                                    tracing::warn!(task_id = %req.id, error = %e, "failed to read body");
                                    let reason = Error::Network(e).to_string();
                                    resp.finish(FetchOutcome::Failed { reason })
                                }
                            };
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(task_id = %req.id, attempt, error = %err, "request failed");

                    let result = AttemptResult::Transport(&err);
                    match self.retry_policy.check(cancel, &result) {
                        RetryDecision::Cancelled => return resp.finish(FetchOutcome::Cancelled),
                        RetryDecision::Stop => {
                            resp.content = Error::ExternalRouting.to_string();
                            let reason = Error::Network(err).to_string();
                            return resp.finish(FetchOutcome::Failed { reason });
                        }
                        RetryDecision::Retry if last_attempt => {
                            resp.content = Error::ExternalRouting.to_string();
                            return resp.finish(FetchOutcome::Exhausted);
                        }
                        RetryDecision::Retry => {
                            let wait = self.backoff.delay(
                                req.retry_wait_min,
                                req.retry_wait_max,
                                attempt,
                                &result,
                            );
                            if !backoff_sleep(cancel, &req.id, attempt, wait).await {
                                return resp.finish(FetchOutcome::Cancelled);
                            }
                        }
                    }
                }
            }
        }

        // Only reachable with a zero attempt budget
        resp.finish(FetchOutcome::Exhausted)
    }
}

/// Sleep for `wait`, returning false if cancelled first
async fn backoff_sleep(cancel: &CancellationToken, id: &TaskId, attempt: u32, wait: Duration) -> bool {
    tracing::debug!(task_id = %id, attempt, wait_ms = saturating_millis(wait), "backing off");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

fn saturating_millis(wait: Duration) -> u64 {
    u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)
}

/// Read at most [`READ_LIMIT`] bytes of the body; `Ok(None)` when cancelled
async fn read_snippet(
    cancel: &CancellationToken,
    mut response: reqwest::Response,
) -> std::result::Result<Option<String>, reqwest::Error> {
    let read = async {
        let mut buf = Vec::with_capacity(READ_LIMIT);
        while buf.len() < READ_LIMIT {
            let Some(chunk) = response.chunk().await? else {
                break;
            };
            let take = chunk.len().min(READ_LIMIT - buf.len());
            buf.extend_from_slice(&chunk[..take]);
        }
        Ok::<_, reqwest::Error>(decode_snippet(&buf, buf.len() == READ_LIMIT))
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        content = read => content.map(Some),
    }
}

/// Decode a body prefix as UTF-8
///
/// When the prefix was cut at [`READ_LIMIT`], a character split by the cut is
/// dropped rather than replaced. Other invalid bytes become U+FFFD.
fn decode_snippet(buf: &[u8], cut: bool) -> String {
    let end = match std::str::from_utf8(buf) {
        Err(e) if cut && e.error_len().is_none() => e.valid_up_to(),
        _ => buf.len(),
    };
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
