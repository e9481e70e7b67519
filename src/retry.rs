//! Bounded exponential backoff for provider calls.
//!
//! Providers make exactly one HTTP attempt per call and classify the outcome
//! as a [`ProviderError`]. [`retry_transient`] re-issues transient failures
//! (HTTP 429, 5xx, network errors) and gives up immediately on permanent
//! ones (other 4xx, malformed responses).

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Longest single backoff, as a power of two over the base delay.
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Outcome of one failed provider attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Classify an HTTP error status: 429 and 5xx are worth retrying.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{provider} API error {status}: {body}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProviderError::Transient(message)
        } else {
            ProviderError::Permanent(message)
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() || e.is_builder() {
            ProviderError::Permanent(e.to_string())
        } else {
            ProviderError::Transient(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(MAX_BACKOFF_SHIFT);
        self.base_delay * (1u32 << shift)
    }
}

/// Failure after the retry loop finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: ProviderError,
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "transient provider failure, retrying"
                );
                attempt += 1;
            }
            Err(last) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last,
                })
            }
        }
    }
}
