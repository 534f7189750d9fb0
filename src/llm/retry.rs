//! Retry engine with a fixed backoff schedule
//!
//! Runs an operation up to `max_retries + 1` times. Attempt 1 starts
//! immediately; retry `i` waits `backoff_schedule[min(i - 1, len - 1)]`
//! first, so the last delay repeats for any further attempts.
//!
//! The cancellation token is watched during every attempt and every backoff
//! wait. When it fires the in-flight attempt is dropped (aborting its HTTP
//! request) and the engine returns the token's reason as an error right away:
//! `Cancelled` for a caller abort, `Timeout` for a deadline. Neither is ever
//! wrapped in `RetryExhausted`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::config::RetryConfig;
use crate::error::QuillError;
use crate::Result;

/// Retry policy: attempt count and backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay before each retry; the last value repeats
    pub backoff_schedule: Vec<Duration>,
    /// Ceiling for the slow-request warning threshold
    pub slow_request_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_schedule: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            slow_request_cap: Duration::from_secs(120),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_schedule: config.backoff_schedule.clone(),
            slow_request_cap: config.slow_request_cap,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            backoff_schedule: Vec::new(),
            ..Self::default()
        }
    }

    /// Initial attempt plus retries
    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.backoff_schedule.is_empty() || retry == 0 {
            return Duration::ZERO;
        }
        let index = ((retry - 1) as usize).min(self.backoff_schedule.len() - 1);
        self.backoff_schedule[index]
    }

    /// When to warn that a request is slow: `min(cap, timeout / 3)`
    pub fn slow_request_threshold(&self, timeout: Duration) -> Duration {
        self.slow_request_cap.min(timeout / 3)
    }
}

/// Progress of a retried operation, reported between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent<'a> {
    /// An attempt is about to start
    Attempt { attempt: u32, total: u32 },
    /// The previous attempt failed and the engine is waiting before the next one
    Backoff {
        next_attempt: u32,
        delay: Duration,
        error: &'a QuillError,
    },
}

/// Execute `operation` under `policy`, aborting as soon as `token` fires.
///
/// The operation receives the 1-based attempt number.
pub async fn execute<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_observed(policy, token, |_| {}, operation).await
}

/// Same as [`execute`], reporting each attempt and backoff to `on_event`
pub async fn execute_observed<F, Fut, T, E>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut on_event: E,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    E: FnMut(RetryEvent<'_>),
{
    let total = policy.total_attempts();
    let mut last_error: Option<QuillError> = None;

    for attempt in 1..=total {
        if let Some(error) = &last_error {
            let delay = policy.delay_for(attempt - 1);
            tracing::debug!(
                attempt,
                total,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            on_event(RetryEvent::Backoff {
                next_attempt: attempt,
                delay,
                error,
            });
            if let Err(reason) = token.run_until_cancelled(tokio::time::sleep(delay)).await {
                tracing::debug!(attempt, ?reason, "Cancelled during backoff");
                return Err(reason.into_error());
            }
        }

        on_event(RetryEvent::Attempt { attempt, total });

        match token.run_until_cancelled(operation(attempt)).await {
            Err(reason) => {
                tracing::debug!(attempt, ?reason, "Cancelled during attempt");
                return Err(reason.into_error());
            }
            Ok(Ok(value)) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded on retry");
                }
                return Ok(value);
            }
            Ok(Err(error)) if !error.is_retryable() => {
                tracing::debug!(attempt, error = %error, "Non-retryable failure");
                return Err(error);
            }
            Ok(Err(error)) => {
                tracing::warn!(attempt, total, error = %error, "Attempt failed");
                last_error = Some(error);
            }
        }
    }

    let last_error = last_error
        .unwrap_or_else(|| QuillError::internal_error("retry loop ended without an attempt"));
    tracing::error!(attempts = total, error = %last_error, "Retries exhausted");
    Err(QuillError::RetryExhausted {
        last_error: Box::new(last_error),
        attempts: total,
    })
}

/// Callback fired once when a request crosses its slow threshold
pub type SlowRequestCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Emits a one-time "slow request" warning if still alive after `threshold`.
///
/// The watcher runs as a background task and is aborted when the guard drops,
/// so it never delays or blocks the request it watches.
pub struct SlowRequestGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl SlowRequestGuard {
    pub fn start(
        threshold: Duration,
        label: impl Into<String>,
        callback: Option<SlowRequestCallback>,
    ) -> Self {
        let label = label.into();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            tracing::warn!(
                request = %label,
                elapsed_ms = threshold.as_millis() as u64,
                "Request is taking longer than expected"
            );
            if let Some(callback) = callback {
                callback(threshold);
            }
        });
        Self { handle }
    }
}

impl Drop for SlowRequestGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
