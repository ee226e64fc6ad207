/*!
 * Error types for Tether
 */

use std::io;
use tether_connect::ConnectError;
use tether_core_resilience::{ContextError, ResilienceError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

/// Errors raised while setting up a client
#[derive(Debug, Error)]
pub enum TetherError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TOML
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Outcome of a call that did not produce a response
#[derive(Debug, Error)]
pub enum CallError {
    /// Rate limiter had no credit within the wait budget
    #[error("Rate limit exceeded: {0}")]
    RateLimited(ResilienceError),

    /// Circuit breaker rejected the call
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Terminal status from the remote service
    #[error("Call failed: {0}")]
    Status(tonic::Status),

    /// Every attempt failed with a retryable status
    #[error("Call failed after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: tonic::Status },

    /// Caller's context was cancelled or its deadline passed
    #[error("Call abandoned: {0}")]
    Cancelled(ContextError),

    /// The last attempt found no usable managed connection
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// The last attempt could not get a connection from the pool
    #[error("Connection pool error: {0}")]
    Pool(ResilienceError),
}

impl CallError {
    /// Rejected before reaching the transport
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, CallError::RateLimited(_) | CallError::CircuitOpen)
    }

    /// Status code the call ended with, if it reached the transport
    pub fn code(&self) -> Option<tonic::Code> {
        match self {
            CallError::Status(status) | CallError::RetryExhausted { last: status, .. } => Some(status.code()),
            _ => None,
        }
    }
}

impl From<ResilienceError> for CallError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen => CallError::CircuitOpen,
            ResilienceError::RateLimitExceeded { .. } => CallError::RateLimited(err),
            ResilienceError::Context(ctx) => CallError::Cancelled(ctx),
            other => CallError::Pool(other),
        }
    }
}
