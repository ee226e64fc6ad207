//! Tether Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks Tether wraps around every outbound
//! RPC call. It includes:
//!
//! - **Call Context**: Cancellation and deadline propagation for every suspension point
//! - **Circuit Breaker**: Fails fast while a service is unhealthy, retries it after a cooldown
//! - **Rate Limiter**: Token bucket admission control with lazy refill
//! - **Retry Executor**: Bounded retries with a pluggable backoff policy
//! - **Connection Pool**: Bounded connection reuse with health checking and idle eviction
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transports (gRPC channels, sockets, TLS)
//! - Wire formats or service schemas
//! - Application-specific concerns
//!
//! Connections are produced by a [`ConnectionFactory`] supplied by the caller,
//! and errors are classified through the [`Retryable`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Call site                       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Prevent overload
//! │  (Token bucket, lazy refill)            │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Executor                    │  ← Absorb transient faults
//! │  (Classify, back off, try again)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Resource efficiency
//! │  (Reuse connections, health checks)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!          Remote service
//! ```
//!
//! # Usage Example
//!
//! ## Basic Circuit Breaker
//!
//! ```no_run
//! use tether_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     reset_timeout: Duration::from_secs(10),
//!     half_open_max_requests: 1,
//! });
//!
//! let result = breaker.call(|| async {
//!     // Your potentially failing operation
//!     Ok::<_, ResilienceError>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry
//!
//! ```no_run
//! use tether_core_resilience::{CallContext, RetryConfig, RetryExecutor};
//!
//! # async fn example() {
//! let executor = RetryExecutor::new();
//! let result = executor
//!     .execute(&CallContext::background(), &RetryConfig::default(), || async {
//!         Err::<(), _>(tonic::Status::unavailable("server restarting"))
//!     })
//!     .await;
//! assert!(result.is_err());
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod context;
pub mod error;
pub mod rate_limiter;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitPermit, CircuitState};
pub use connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use context::{CallContext, ContextError};
pub use error::ResilienceError;
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{BackoffPolicy, BackoffStrategy, RetryConfig, RetryError, RetryExecutor, Retryable};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tether_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitPermit, CircuitState};
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PooledConnection};
    pub use super::context::{CallContext, ContextError};
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::{RateLimiter, RateLimiterConfig};
    pub use super::retry::{BackoffPolicy, RetryConfig, RetryError, RetryExecutor, Retryable};
}
