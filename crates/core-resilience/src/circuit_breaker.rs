//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: A limited number of trial requests test if the service recovered
//!
//! The Open → HalfOpen move is not driven by a timer. Every admission check
//! starts with an explicit [`transition`](CircuitBreaker::is_allowed) step that
//! compares the elapsed time since the last failure against the reset timeout,
//! all under the breaker's single mutex. The transition itself consumes the
//! first half-open trial slot.
//!
//! State changes are published as [`CircuitEvent`]s on a broadcast channel;
//! publishing never blocks the breaker and tolerates zero subscribers.
//!
//! Callers that suspend between admission and outcome should hold a
//! [`CircuitPermit`] from [`CircuitBreaker::try_acquire`]. A permit dropped
//! without a recorded outcome counts as a failure, so a cancelled half-open
//! trial reopens the circuit instead of holding its slot forever.

use super::error::ResilienceError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::Span;

/// Capacity of the transition event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// State transition published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    /// Breaker tripped (from Closed or HalfOpen)
    Opened,
    /// Reset timeout elapsed, probing
    HalfOpened,
    /// Breaker recovered or was reset while open
    Closed,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub reset_timeout: Duration,
    /// Trial requests admitted in half-open; the same number of successes closes the circuit
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(10),
            half_open_max_requests: 1,
        }
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    /// Consecutive failures while closed
    failure_count: u32,
    /// Successes recorded in the current half-open episode
    success_count: u32,
    /// Admissions granted in the current half-open episode
    request_count: u32,
    /// Bumped on every Open → HalfOpen move
    episode: u64,
    last_failure_time: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            request_count: 0,
            episode: 0,
            last_failure_time: None,
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```
/// use tether_core_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     failure_threshold: 2,
///     reset_timeout: Duration::from_secs(30),
///     half_open_max_requests: 1,
/// });
///
/// assert!(breaker.is_allowed());
/// breaker.on_failure();
/// breaker.on_failure();
///
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(!breaker.is_allowed());
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    events: broadcast::Sender<CircuitEvent>,
    span: Span,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        config.half_open_max_requests = config.half_open_max_requests.max(1);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
            events,
            span: Span::none(),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Attach the span that transition logs are emitted under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Effective configuration (after clamping)
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Get the current state of the circuit breaker
    ///
    /// This is a plain read; it does not evaluate the reset timeout.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Decide whether a request may be dispatched now
    pub fn is_allowed(&self) -> bool {
        let mut state = self.lock();
        self.admit(&mut state)
    }

    fn admit(&self, state: &mut CircuitBreakerState) -> bool {
        if self.transition(state, Instant::now()) {
            // Entering half-open consumes the first trial slot
            state.request_count = 1;
            return true;
        }

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.request_count < self.config.half_open_max_requests {
                    state.request_count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Admit a request and return a permit that records its outcome
    ///
    /// Returns `None` when the request is rejected.
    pub fn try_acquire(&self) -> Option<CircuitPermit> {
        let mut state = self.lock();
        if !self.admit(&mut state) {
            return None;
        }
        let half_open_episode = (state.state == CircuitState::HalfOpen).then_some(state.episode);
        drop(state);

        Some(CircuitPermit {
            breaker: self.clone(),
            half_open_episode,
            settled: false,
        })
    }

    /// Record a successful request
    pub fn on_success(&self) {
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;

                if state.success_count >= self.config.half_open_max_requests {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.request_count = 0;
                    self.publish(CircuitState::HalfOpen, CircuitEvent::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub fn on_failure(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        state.last_failure_time = Some(now);

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;

                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    tracing::warn!(
                        parent: &self.span,
                        failures = state.failure_count,
                        "circuit breaker tripped"
                    );
                    self.publish(CircuitState::Closed, CircuitEvent::Opened);
                }
            }
            CircuitState::HalfOpen => {
                // Any failed trial reopens the circuit
                state.state = CircuitState::Open;
                state.success_count = 0;
                self.publish(CircuitState::HalfOpen, CircuitEvent::Opened);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed
    ///
    /// Close subscribers are notified only when the breaker was open.
    pub fn reset(&self) {
        let mut state = self.lock();
        let previous = state.state;

        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.request_count = 0;

        tracing::info!(parent: &self.span, from = %previous, "circuit breaker reset");

        if previous == CircuitState::Open {
            let _ = self.events.send(CircuitEvent::Closed);
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Rejected calls fail with [`ResilienceError::CircuitOpen`] without running `op`.
    /// Admission rejections returned by `op` are not counted as failures.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        let permit = self.try_acquire().ok_or(ResilienceError::CircuitOpen)?;

        match op().await {
            Ok(result) => {
                permit.success();
                Ok(result)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    permit.failure();
                } else {
                    permit.release();
                }
                Err(e)
            }
        }
    }

    /// Hand a half-open trial slot back without recording an outcome
    fn release_trial(&self, episode: u64) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen && state.episode == episode {
            state.request_count = state.request_count.saturating_sub(1);
        }
    }

    /// Evaluate the lazy Open → HalfOpen transition. Returns true if it happened.
    fn transition(&self, state: &mut CircuitBreakerState, now: Instant) -> bool {
        if state.state != CircuitState::Open {
            return false;
        }

        let elapsed = match state.last_failure_time {
            Some(at) => now.saturating_duration_since(at) >= self.config.reset_timeout,
            None => true,
        };
        if !elapsed {
            return false;
        }

        state.state = CircuitState::HalfOpen;
        state.request_count = 0;
        state.success_count = 0;
        state.episode += 1;
        self.publish(CircuitState::Open, CircuitEvent::HalfOpened);
        true
    }

    fn publish(&self, from: CircuitState, event: CircuitEvent) {
        tracing::info!(parent: &self.span, %from, ?event, "circuit breaker transition");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
///
/// Exactly one outcome is recorded per permit. Dropping it unsettled records
/// a failure.
#[must_use = "dropping a permit records a failure"]
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: CircuitBreaker,
    half_open_episode: Option<u64>,
    settled: bool,
}

impl CircuitPermit {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }

    /// Record `Ok` as success and anything else as failure
    pub fn record<T, E>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.success(),
            Err(_) => self.failure(),
        }
    }

    /// Settle without an outcome; a half-open slot is returned to the breaker
    pub fn release(mut self) {
        self.settled = true;
        if let Some(episode) = self.half_open_episode {
            self.breaker.release_trial(episode);
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(parent: &self.breaker.span, "circuit permit dropped without an outcome");
            self.breaker.on_failure();
        }
    }
}
