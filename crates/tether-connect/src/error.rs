//! Error types for the tether-connect crate

use crate::transport::ConnectivityState;
use std::time::Duration;
use tether_core_resilience::{ContextError, ResilienceError, Retryable};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("Connection target must not be empty")]
    EmptyTarget,

    #[error("Failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("Timed out after {timeout:?} waiting for {target} to become ready")]
    Timeout { target: String, timeout: Duration },

    #[error("Connection to {target} failed in state {state}")]
    Failed {
        target: String,
        state: ConnectivityState,
    },

    #[error("Connection attempt abandoned: {0}")]
    Cancelled(ContextError),

    #[error("Failed to close connection: {0}")]
    Close(String),

    #[error("Connection pool error: {0}")]
    Pool(#[from] ResilienceError),
}

impl Retryable for ConnectError {
    fn is_retryable(&self) -> bool {
        match self {
            ConnectError::Dial { .. }
            | ConnectError::Timeout { .. }
            | ConnectError::Failed { .. }
            | ConnectError::Cancelled(_) => true,
            ConnectError::Pool(err) => err.is_retryable(),
            ConnectError::EmptyTarget | ConnectError::Close(_) => false,
        }
    }
}
