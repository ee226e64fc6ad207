/*!
 * Tether - client-side resilience for RPC calls
 *
 * Sits between application call sites and a remote RPC transport:
 * - Connection management with health checking and reconnection
 * - Circuit breaking on consecutive failures
 * - Token-bucket rate limiting
 * - Retries with configurable backoff and status classification
 * - Bounded connection pooling
 * - Call outcome and latency metrics
 *
 * The building blocks live in `tether-core-resilience` and `tether-connect`;
 * this crate adds configuration, logging, metrics, and the [`TetherClient`]
 * facade that wires them together.
 */

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;

// Re-export commonly used types
pub use client::TetherClient;
pub use config::{ConnectionMode, LogLevel, LoggingConfig, TetherConfig};
pub use error::{CallError, Result, TetherError};
pub use logging::init_logging;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use pipeline::CallPipeline;

pub use tether_connect::{ConnectivityState, Transport, TransportHandle};
pub use tether_core_resilience::{CallContext, CircuitState, ContextError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
