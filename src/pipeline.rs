/*!
 * The interceptor chain every outbound call runs through
 *
 * Order: rate limiter wait, circuit breaker admission, retried invocation,
 * breaker outcome, metrics. Admission rejections are returned as-is and never
 * retried; the breaker sees exactly one outcome per admitted call, including
 * calls whose future is dropped before they finish.
 */

use std::future::Future;
use std::sync::Arc;
use tether_core_resilience::{CallContext, CircuitBreaker, RateLimiter, RetryConfig, RetryError, RetryExecutor};
use tokio::time::Instant;
use tracing::{debug, warn, Span};

use crate::config::TetherConfig;
use crate::error::CallError;
use crate::metrics::MetricsCollector;

/// Resilience policy wrapped around each call
#[derive(Debug, Clone)]
pub struct CallPipeline {
    rate_limiter: Option<RateLimiter>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: RetryExecutor,
    retry_config: RetryConfig,
    metrics: Arc<MetricsCollector>,
    span: Span,
}

impl Default for CallPipeline {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl CallPipeline {
    /// Retries only; no admission control
    pub fn new(retry_config: RetryConfig) -> Self {
        Self {
            rate_limiter: None,
            circuit_breaker: None,
            retry: RetryExecutor::new(),
            retry_config,
            metrics: Arc::new(MetricsCollector::default()),
            span: Span::none(),
        }
    }

    /// Build the chain described by `config`, logging under `span`
    pub fn from_config(config: &TetherConfig, span: Span) -> Self {
        let mut pipeline = Self::new(config.retry_config()).with_span(span.clone());
        if let Some(limiter) = config.rate_limiter_config() {
            pipeline = pipeline.with_rate_limiter(RateLimiter::new(limiter).with_span(span.clone()));
        }
        if let Some(breaker) = config.circuit_breaker_config() {
            pipeline = pipeline.with_circuit_breaker(CircuitBreaker::new(breaker).with_span(span));
        }
        pipeline
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Share a collector with other pipelines
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.retry = self.retry.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Run `op` under the full chain
    ///
    /// `op` is invoked once per attempt. Rate limiting and breaker rejections
    /// are recorded as errors but not as requests.
    pub async fn call<T, F, Fut>(&self, ctx: &CallContext, op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, tonic::Status>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            if let Err(err) = limiter.wait(ctx).await {
                debug!(parent: &self.span, error = %err, "call rejected by rate limiter");
                let err = CallError::from(err);
                self.metrics.record_error(&err);
                return Err(err);
            }
        }

        let permit = match &self.circuit_breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    debug!(parent: &self.span, state = %breaker.state(), "call rejected by circuit breaker");
                    let err = CallError::CircuitOpen;
                    self.metrics.record_error(&err);
                    return Err(err);
                }
            },
            None => None,
        };

        let started = Instant::now();
        let result = self.retry.execute(ctx, &self.retry_config, op).await;
        let latency = started.elapsed();

        if let Some(permit) = permit {
            permit.record(&result);
        }

        self.metrics.record_request(result.is_ok(), latency);

        result.map_err(|err| {
            let err = match err {
                RetryError::Exhausted { attempts, last } => CallError::RetryExhausted { attempts, last },
                RetryError::NonRetryable(status) => CallError::Status(status),
                RetryError::Cancelled(ctx_err) => CallError::Cancelled(ctx_err),
            };
            warn!(parent: &self.span, error = %err, ?latency, "call failed");
            self.metrics.record_error(&err);
            err
        })
    }
}
