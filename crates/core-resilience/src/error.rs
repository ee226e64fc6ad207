//! Error types for the resilience primitives

use crate::context::ContextError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Token bucket had no credit within the allowed wait
    #[error("Rate limit exceeded ({rate:.2} requests/s): {reason}")]
    RateLimitExceeded { rate: f64, reason: String },

    /// Operation attempted after the pool was closed
    #[error("Connection pool is closed")]
    PoolClosed,

    /// No pooled connection became available in time
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    /// Connection handed back to a pool that did not create it
    #[error("Connection does not belong to this pool")]
    ForeignConnection,

    /// Connection creation failed
    #[error("Failed to create connection: {0}")]
    ConnectionCreation(String),

    /// Caller's context was cancelled or its deadline passed
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl ResilienceError {
    /// Admission-control rejections are returned to the caller and never retried internally
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::RateLimitExceeded { .. }
                | ResilienceError::AcquireTimeout(_)
                | ResilienceError::PoolClosed
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        !self.is_admission_rejection()
    }
}
