//! Pluggable retry and backoff policies
//!
//! A [`Fetcher`](super::Fetcher) asks its [`RetryPolicy`] after every attempt
//! whether to try again, and its [`Backoff`] how long to wait before doing so.
//! Both are traits with blanket implementations for plain functions and
//! closures, so a caller can swap either behaviour without a new type:
//!
//! ```
//! use std::time::Duration;
//! use url_fetcher::fetcher::{AttemptResult, Fetcher};
//!
//! fn fixed(_min: Duration, _max: Duration, _attempt: u32, _last: &AttemptResult<'_>) -> Duration {
//!     Duration::from_millis(10)
//! }
//!
//! # fn example(client: reqwest::Client) {
//! let fetcher = Fetcher::new(client).with_backoff(fixed);
//! # }
//! ```

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tokio_util::sync::CancellationToken;

/// What a single HTTP attempt produced
#[derive(Debug, Clone, Copy)]
pub enum AttemptResult<'a> {
    /// The server answered
    Response {
        /// Response status
        status: StatusCode,
        /// Response headers
        headers: &'a HeaderMap,
    },
    /// The request never produced a response
    Transport(&'a (dyn std::error::Error + Send + Sync + 'static)),
}

impl AttemptResult<'_> {
    /// Status code of the response, if there was one
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            AttemptResult::Response { status, .. } => Some(*status),
            AttemptResult::Transport(_) => None,
        }
    }
}

/// Decision returned by a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait and try again
    Retry,
    /// Keep the current attempt as the final result
    Stop,
    /// The cancellation token fired; stop and report cancellation
    Cancelled,
}

/// Decides whether an attempt should be retried
pub trait RetryPolicy: Send + Sync {
    /// Inspect the attempt and the caller's cancellation token
    fn check(&self, cancel: &CancellationToken, attempt: &AttemptResult<'_>) -> RetryDecision;
}

impl<F> RetryPolicy for F
where
    F: Fn(&CancellationToken, &AttemptResult<'_>) -> RetryDecision + Send + Sync,
{
    fn check(&self, cancel: &CancellationToken, attempt: &AttemptResult<'_>) -> RetryDecision {
        self(cancel, attempt)
    }
}

/// Computes how long to wait before the next attempt
pub trait Backoff: Send + Sync {
    /// `attempt` is the number of the attempt that just failed (starting at 1)
    fn delay(&self, min: Duration, max: Duration, attempt: u32, last: &AttemptResult<'_>)
    -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(Duration, Duration, u32, &AttemptResult<'_>) -> Duration + Send + Sync,
{
    fn delay(
        &self,
        min: Duration,
        max: Duration,
        attempt: u32,
        last: &AttemptResult<'_>,
    ) -> Duration {
        self(min, max, attempt, last)
    }
}

/// Retries transport errors, 429 and 503; never retries once cancelled
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn check(&self, cancel: &CancellationToken, attempt: &AttemptResult<'_>) -> RetryDecision {
        if cancel.is_cancelled() {
            return RetryDecision::Cancelled;
        }

        match attempt {
            AttemptResult::Transport(_) => RetryDecision::Retry,
            // Both may carry a Retry-After header telling us when to come back
            AttemptResult::Response { status, .. }
                if *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::SERVICE_UNAVAILABLE =>
            {
                RetryDecision::Retry
            }
            AttemptResult::Response { .. } => RetryDecision::Stop,
        }
    }
}

/// `min * 2^attempt` capped at `max`, honouring `Retry-After` on 429/503
#[derive(Debug, Clone, Copy, Default)]
pub struct ExponentialBackoff;

impl Backoff for ExponentialBackoff {
    fn delay(
        &self,
        min: Duration,
        max: Duration,
        attempt: u32,
        last: &AttemptResult<'_>,
    ) -> Duration {
        retry_after(last).unwrap_or_else(|| exponential_delay(min, max, attempt))
    }
}

/// [`ExponentialBackoff`] scaled by a random factor in `[1, 2]`, still capped at `max`
///
/// Spreads out workers that fail at the same moment. `Retry-After` is honoured
/// verbatim, without jitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitteredBackoff;

impl Backoff for JitteredBackoff {
    fn delay(
        &self,
        min: Duration,
        max: Duration,
        attempt: u32,
        last: &AttemptResult<'_>,
    ) -> Duration {
        retry_after(last).unwrap_or_else(|| add_jitter(exponential_delay(min, max, attempt)).min(max))
    }
}

/// `min * 2^attempt`, clamped to `max` when larger or not representable
pub fn exponential_delay(min: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let nanos = 2f64.powi(exponent) * min.as_nanos() as f64;

    if !nanos.is_finite() || nanos >= max.as_nanos() as f64 || nanos >= u64::MAX as f64 {
        return max;
    }

    Duration::from_nanos(nanos as u64)
}

/// Server-requested wait, only for 429 and 503 responses
///
/// The header must hold a non-negative integer number of seconds; HTTP-date
/// values are ignored.
pub fn retry_after(last: &AttemptResult<'_>) -> Option<Duration> {
    let AttemptResult::Response { status, headers } = last else {
        return None;
    };

    if *status != StatusCode::TOO_MANY_REQUESTS && *status != StatusCode::SERVICE_UNAVAILABLE {
        return None;
    }

    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Jitter is uniformly distributed between 0% and 100% of the delay
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    const MIN: Duration = Duration::from_millis(50);
    const MAX: Duration = Duration::from_secs(5);

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn io_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
    }

    // -----------------------------------------------------------------------
    // DefaultRetryPolicy
    // -----------------------------------------------------------------------

    #[test]
    fn success_is_not_retried() {
        let headers = HeaderMap::new();
        let attempt = AttemptResult::Response {
            status: StatusCode::OK,
            headers: &headers,
        };

        assert_eq!(
            DefaultRetryPolicy.check(&CancellationToken::new(), &attempt),
            RetryDecision::Stop
        );
    }

    #[test]
    fn too_many_requests_and_unavailable_are_retried() {
        let headers = HeaderMap::new();
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE] {
            let attempt = AttemptResult::Response {
                status,
                headers: &headers,
            };
            assert_eq!(
                DefaultRetryPolicy.check(&CancellationToken::new(), &attempt),
                RetryDecision::Retry,
                "{status} should be retried"
            );
        }
    }

    #[test]
    fn other_client_and_server_errors_are_terminal() {
        let headers = HeaderMap::new();
        for status in [
            StatusCode::NOT_FOUND,
            StatusCode::FORBIDDEN,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
        ] {
            let attempt = AttemptResult::Response {
                status,
                headers: &headers,
            };
            assert_eq!(
                DefaultRetryPolicy.check(&CancellationToken::new(), &attempt),
                RetryDecision::Stop,
                "{status} should not be retried"
            );
        }
    }

    #[test]
    fn transport_errors_are_retried() {
        let err = io_error();
        let attempt = AttemptResult::Transport(&err);

        assert_eq!(
            DefaultRetryPolicy.check(&CancellationToken::new(), &attempt),
            RetryDecision::Retry
        );
        assert_eq!(attempt.status(), None);
    }

    #[test]
    fn cancellation_wins_over_everything() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = io_error();
        let headers = HeaderMap::new();
        let attempts = [
            AttemptResult::Transport(&err),
            AttemptResult::Response {
                status: StatusCode::SERVICE_UNAVAILABLE,
                headers: &headers,
            },
            AttemptResult::Response {
                status: StatusCode::OK,
                headers: &headers,
            },
        ];

        for attempt in attempts {
            assert_eq!(
                DefaultRetryPolicy.check(&cancel, &attempt),
                RetryDecision::Cancelled
            );
        }
    }

    fn never_retry(_: &CancellationToken, _: &AttemptResult<'_>) -> RetryDecision {
        RetryDecision::Stop
    }

    #[test]
    fn functions_can_act_as_policies() {
        let err = io_error();

        assert_eq!(
            never_retry.check(&CancellationToken::new(), &AttemptResult::Transport(&err)),
            RetryDecision::Stop
        );
    }

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn exponential_delay_doubles_per_attempt() {
        let err = io_error();
        let last = AttemptResult::Transport(&err);

        for n in 1..=6 {
            let expected = MIN * 2u32.pow(n);
            assert_eq!(
                ExponentialBackoff.delay(MIN, MAX, n, &last),
                expected,
                "attempt {n}"
            );
        }
    }

    #[test]
    fn exponential_delay_is_clamped_to_max() {
        // 50ms * 2^7 = 6.4s > 5s
        assert_eq!(exponential_delay(MIN, MAX, 7), MAX);
        assert_eq!(exponential_delay(MIN, MAX, 64), MAX);
        assert_eq!(exponential_delay(MIN, MAX, u32::MAX), MAX, "overflow clamps");
        assert_eq!(exponential_delay(MIN, MAX, 0), MIN);
    }

    #[test]
    fn retry_after_is_honoured_verbatim_on_429_and_503() {
        let headers = headers_with_retry_after("2");
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE] {
            let last = AttemptResult::Response {
                status,
                headers: &headers,
            };
            for attempt in [1, 2, 10] {
                assert_eq!(
                    ExponentialBackoff.delay(MIN, MAX, attempt, &last),
                    Duration::from_secs(2),
                    "{status} attempt {attempt}"
                );
            }
        }
    }

    #[test]
    fn retry_after_is_not_clamped() {
        let headers = headers_with_retry_after("30");
        let last = AttemptResult::Response {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers: &headers,
        };

        assert_eq!(
            ExponentialBackoff.delay(MIN, MAX, 1, &last),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn retry_after_ignored_for_other_statuses_and_bad_values() {
        let headers = headers_with_retry_after("2");
        let last = AttemptResult::Response {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: &headers,
        };
        assert_eq!(ExponentialBackoff.delay(MIN, MAX, 1, &last), MIN * 2);

        for value in ["soon", "-1", "Wed, 21 Oct 2015 07:28:00 GMT"] {
            let headers = headers_with_retry_after(value);
            let last = AttemptResult::Response {
                status: StatusCode::TOO_MANY_REQUESTS,
                headers: &headers,
            };
            assert_eq!(
                ExponentialBackoff.delay(MIN, MAX, 2, &last),
                MIN * 4,
                "{value:?} must fall back to exponential"
            );
        }
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let err = io_error();
        let last = AttemptResult::Transport(&err);

        for _ in 0..200 {
            let delay = JitteredBackoff.delay(MIN, MAX, 2, &last);
            assert!(delay >= MIN * 4, "jittered {delay:?} below base");
            assert!(delay <= MIN * 8, "jittered {delay:?} above 2x base");
        }

        for _ in 0..50 {
            assert!(JitteredBackoff.delay(MIN, MAX, 6, &last) <= MAX);
        }
    }

    #[test]
    fn jitter_on_zero_delay_returns_zero() {
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }
}
