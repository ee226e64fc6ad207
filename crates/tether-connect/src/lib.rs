//! Tether Connect: connection lifecycle for the Tether client
//!
//! This crate owns everything between "I have a target address" and "I have a
//! ready transport handle to issue a call on". It never touches the wire: the
//! actual dialing is delegated to a [`Transport`] implementation.
//!
//! # Architecture
//!
//! - **ConnectionManager**: Owns one handle to one target, connects, reconnects, closes
//! - **HealthChecker**: Background task that re-establishes a failed manager connection
//! - **TransportConnectionFactory**: Plugs a transport into the generic connection pool
//! - **testing::MockTransport**: Scriptable in-memory transport
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tether_connect::testing::MockTransport;
//! use tether_connect::{ConnectionManager, HealthCheckConfig, ManagerConfig};
//!
//! # async fn example() -> Result<(), tether_connect::ConnectError> {
//! let manager = ConnectionManager::connect(
//!     Arc::new(MockTransport::new()),
//!     ManagerConfig {
//!         health_check: HealthCheckConfig {
//!             enabled: true,
//!             interval: Duration::from_secs(30),
//!         },
//!         ..ManagerConfig::new("10.0.0.5:50051")
//!     },
//! )
//! .await?;
//!
//! manager.set_reconnect_callback(|| tracing::info!("connection re-established"));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod testing;
pub mod transport;

pub use error::ConnectError;
pub use health::{CheckOutcome, HealthCheckConfig, HealthChecker, HealthStats};
pub use manager::{ConnectionManager, ManagerConfig, WeakConnectionManager};
pub use pool::{connect_pool, TransportConnectionFactory, TransportPool};
pub use transport::{ConnectivityState, Transport, TransportHandle};
