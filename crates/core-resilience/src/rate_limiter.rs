//! Rate limiting for preventing service overload
//!
//! Token bucket with a continuous (floating point) balance. Credit is refilled
//! lazily on every check from the time elapsed since the previous refill; there
//! is no background timer. Fractional credit carries over between calls and a
//! request consumes exactly one whole token.

use super::context::{sleep_until, CallContext};
use super::error::ResilienceError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::Span;

/// Interval between admission attempts while waiting for a token
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the token bucket
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Sustained refill rate; values `<= 0` fall back to 1.0
    pub requests_per_second: f64,
    /// Bucket capacity; values `<= 0` fall back to `requests_per_second`
    pub max_burst: f64,
    /// How long `wait` may block for a token; zero means do not wait
    pub wait_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            max_burst: 20.0,
            wait_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Settle credit accrued since the last refill. Caller holds the lock.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
            self.last_refill = now;
        }
    }
}

/// Rate limiter using token bucket algorithm
///
/// # Example
/// ```
/// use tether_core_resilience::{RateLimiter, RateLimiterConfig};
/// use std::time::Duration;
///
/// let limiter = RateLimiter::new(RateLimiterConfig {
///     requests_per_second: 10.0,
///     max_burst: 2.0,
///     wait_timeout: Duration::ZERO,
/// });
///
/// assert!(limiter.allow());
/// assert!(limiter.allow());
/// assert!(!limiter.allow());
/// ```
#[derive(Clone, Debug)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    wait_timeout: Duration,
    span: Span,
}

impl RateLimiter {
    /// Create a new rate limiter; the bucket starts full
    pub fn new(config: RateLimiterConfig) -> Self {
        let refill_rate = if config.requests_per_second > 0.0 {
            config.requests_per_second
        } else {
            1.0
        };
        let max_tokens = if config.max_burst > 0.0 {
            config.max_burst
        } else {
            refill_rate
        };

        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: max_tokens,
                max_tokens,
                refill_rate,
                last_refill: Instant::now(),
            })),
            wait_timeout: config.wait_timeout,
            span: Span::none(),
        }
    }

    /// Create a rate limiter with requests per second (burst equals the rate)
    pub fn per_second(requests_per_second: f64) -> Self {
        Self::new(RateLimiterConfig {
            requests_per_second,
            max_burst: requests_per_second,
            wait_timeout: Duration::ZERO,
        })
    }

    /// Attach the span that limiter logs are emitted under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Take one token if available. Never blocks.
    pub fn allow(&self) -> bool {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available
    ///
    /// With a zero `wait_timeout` this is a single [`allow`](Self::allow). Otherwise
    /// it polls every [`WAIT_POLL_INTERVAL`] until admitted, until `ctx` is done, or
    /// until `wait_timeout` (capped by the context deadline) elapses.
    pub async fn wait(&self, ctx: &CallContext) -> Result<(), ResilienceError> {
        if self.wait_timeout.is_zero() {
            if self.allow() {
                return Ok(());
            }
            return Err(self.exceeded("rate limit reached and waiting is disabled"));
        }

        let deadline = ctx.deadline_within(self.wait_timeout);
        let mut ticker = tokio::time::interval(WAIT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.allow() {
                return Ok(());
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => {
                    tracing::debug!(parent: &self.span, "timed out waiting for a rate limit token");
                    return Err(self.exceeded("timed out waiting for an available token"));
                }
                err = ctx.done() => {
                    tracing::debug!(parent: &self.span, %err, "rate limit wait abandoned");
                    return Err(self.exceeded(&format!("{} while waiting for a token", err)));
                }
            }
        }
    }

    /// Execute an operation once a token is available
    pub async fn execute<F, Fut, T>(&self, ctx: &CallContext, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        self.wait(ctx).await?;
        op().await
    }

    /// Change the refill rate; rates `<= 0` are ignored
    ///
    /// Credit accrued under the old rate is settled first. A rate above the current
    /// capacity raises the capacity to match.
    pub fn set_rate(&self, requests_per_second: f64) {
        if requests_per_second <= 0.0 {
            return;
        }

        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.refill_rate = requests_per_second;

        if requests_per_second > bucket.max_tokens {
            bucket.max_tokens = requests_per_second;
        }
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);

        tracing::debug!(parent: &self.span, rate = requests_per_second, "rate limit changed");
    }

    /// Current refill rate in tokens per second
    pub fn current_rate(&self) -> f64 {
        self.lock().refill_rate
    }

    /// Bucket capacity
    pub fn max_tokens(&self) -> f64 {
        self.lock().max_tokens
    }

    /// Current balance after settling accrued credit
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    fn exceeded(&self, reason: &str) -> ResilienceError {
        ResilienceError::RateLimitExceeded {
            rate: self.current_rate(),
            reason: reason.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
