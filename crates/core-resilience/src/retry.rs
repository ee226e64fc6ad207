//! Retry with backoff
//!
//! [`RetryExecutor::execute`] invokes an operation up to `max_retries + 1` times.
//! Between attempts it sleeps for the delay chosen by the configured
//! [`BackoffPolicy`], racing the caller's [`CallContext`]. Errors are classified
//! through the [`Retryable`] trait: terminal errors are returned unchanged on the
//! attempt that produced them.

use super::context::{CallContext, ContextError};
use super::error::ResilienceError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};
use tracing::Span;

/// Status codes that indicate a transient server-side condition
pub const RETRYABLE_CODES: [Code; 5] = [
    Code::Unavailable,
    Code::DeadlineExceeded,
    Code::ResourceExhausted,
    Code::Aborted,
    Code::Internal,
];

const CONNECTION_ERROR_KEYWORDS: [&str; 8] = [
    "connection",
    "connectivity",
    "transport",
    "broken pipe",
    "reset by peer",
    "timeout",
    "deadline",
    "closed",
];

/// Classifies an error as worth another attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Status {
    fn is_retryable(&self) -> bool {
        RETRYABLE_CODES.contains(&self.code())
    }
}

impl Retryable for ContextError {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for ResilienceError {
    fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::Transient(_)
            | ResilienceError::ConnectionCreation(_)
            | ResilienceError::Context(_) => true,
            ResilienceError::Permanent(message) => is_connection_error_message(message),
            _ => false,
        }
    }
}

/// Heuristic for untyped errors: does the text look like a connection problem?
pub fn is_connection_error_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    CONNECTION_ERROR_KEYWORDS
        .iter()
        .any(|keyword| message.contains(keyword))
}

/// User-supplied delay schedule
pub trait BackoffStrategy: Send + Sync {
    /// Delay before retry number `attempt` (1-based)
    fn next_delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn next_delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Delay schedule between attempts
#[derive(Clone)]
pub enum BackoffPolicy {
    /// Same delay before every retry
    Fixed(Duration),
    /// `base * factor^attempt`, optionally capped at `max`
    Exponential {
        base: Duration,
        factor: f64,
        max: Option<Duration>,
    },
    Custom(Arc<dyn BackoffStrategy>),
}

impl BackoffPolicy {
    /// `100ms * 2^attempt`
    pub fn exponential() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: None,
        }
    }

    pub fn custom<S: BackoffStrategy + 'static>(strategy: S) -> Self {
        BackoffPolicy::Custom(Arc::new(strategy))
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(delay) => *delay,
            BackoffPolicy::Exponential { base, factor, max } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = (base.as_secs_f64() * factor.powi(exponent)).max(0.0);
                let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
                match max {
                    Some(max) => delay.min(*max),
                    None => delay,
                }
            }
            BackoffPolicy::Custom(strategy) => strategy.next_delay(attempt),
        }
    }
}

impl fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffPolicy::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            BackoffPolicy::Exponential { base, factor, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            BackoffPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; zero disables retrying
    pub max_retries: u32,
    /// Delay used when no policy is set
    pub retry_delay: Duration,
    pub policy: Option<BackoffPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            policy: Some(BackoffPolicy::exponential()),
        }
    }
}

impl RetryConfig {
    /// No retries: the operation runs exactly once
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.policy {
            Some(policy) => policy.next_delay(attempt),
            None => self.retry_delay,
        }
    }
}

/// Outcome of a call that did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// Error returned as-is without retrying: it was terminal, or retrying is
    /// disabled (`max_retries == 0`)
    #[error("{0}")]
    NonRetryable(E),

    /// Caller's context ended during backoff
    #[error("retry abandoned: {0}")]
    Cancelled(ContextError),
}

impl<E> RetryError<E> {
    /// Error produced by the last attempt, if one ran
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::NonRetryable(last) => Some(last),
            RetryError::Cancelled(_) => None,
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::NonRetryable(last) => Some(last),
            RetryError::Cancelled(_) => None,
        }
    }
}

/// Runs operations under a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    span: Span,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self { span: Span::none() }
    }

    /// Attach the span that retry logs are emitted under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Invoke `op` until it succeeds, fails terminally, or attempts run out
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        config: &RetryConfig,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let max_retries = config.max_retries;
        if max_retries == 0 {
            return op().await.map_err(RetryError::NonRetryable);
        }
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = config.delay_for(attempt);
                tracing::debug!(parent: &self.span, attempt, ?delay, "retrying call");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    err = ctx.done() => {
                        tracing::debug!(parent: &self.span, attempt, %err, "retry abandoned during backoff");
                        return Err(RetryError::Cancelled(err));
                    }
                }
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => {
                    tracing::debug!(parent: &self.span, attempt, error = %err, "terminal error, not retrying");
                    return Err(RetryError::NonRetryable(err));
                }
                Err(err) if attempt >= max_retries => {
                    tracing::warn!(
                        parent: &self.span,
                        attempts = max_retries + 1,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: max_retries + 1,
                        last: err,
                    });
                }
                Err(err) => {
                    tracing::debug!(parent: &self.span, attempt, error = %err, "retryable error");
                }
            }

            attempt += 1;
        }
    }
}
