//! Transport capability consumed by the connection layer
//!
//! Tether does not dial, frame, or serialize anything itself. A [`Transport`]
//! produces [`TransportHandle`]s that expose a connectivity state machine; the
//! manager, health checker, and pool only ever observe and drive that machine.

use crate::error::ConnectError;
use std::fmt;
use tether_core_resilience::CallContext;

/// Connectivity state of a transport handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// States that require a new connection
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown
        )
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// An open (or opening) connection to one target
#[async_trait::async_trait]
pub trait TransportHandle: Send + Sync + 'static {
    /// Address this handle was dialed to
    fn target(&self) -> &str;

    /// Begin connecting if idle. Must not block.
    fn connect(&self);

    /// Current connectivity state
    fn state(&self) -> ConnectivityState;

    /// Wait until the state differs from `last`
    ///
    /// Returns `false` if `ctx` ends first.
    async fn wait_for_state_change(&self, ctx: &CallContext, last: ConnectivityState) -> bool;

    /// Release the connection. The state becomes `Shutdown`.
    async fn close(&self) -> Result<(), ConnectError>;
}

/// Produces transport handles
pub trait Transport: Send + Sync + 'static {
    type Handle: TransportHandle;

    /// Create a handle for `target` without waiting for it to connect
    fn dial(&self, target: &str) -> Result<Self::Handle, ConnectError>;
}
