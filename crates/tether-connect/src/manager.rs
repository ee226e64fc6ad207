//! ConnectionManager: single-connection lifecycle for one target
//!
//! The manager is the sole owner of its transport handle. Callers borrow the
//! handle per call through [`ConnectionManager::handle`]; reconnection swaps a
//! new handle into the slot in one write so a caller never sees a partially
//! replaced connection.

use crate::error::ConnectError;
use crate::health::{HealthCheckConfig, HealthChecker};
use crate::transport::{ConnectivityState, Transport, TransportHandle};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tether_core_resilience::{CallContext, ContextError};
use tracing::{debug, error, info, warn, Span};

/// Settings for a [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Address of the remote service (e.g., "10.0.0.5:50051")
    pub target: String,

    /// Budget for the initial connection to become ready
    pub connect_timeout: Duration,

    /// Budget for a reconnection when the caller's context has no deadline
    pub reconnect_timeout: Duration,

    pub health_check: HealthCheckConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            connect_timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(10),
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }
}

/// Dial `target` and wait until the handle is ready
///
/// The wait never spins: it blocks on state changes, bounded by `timeout` and
/// by `ctx`. A handle that fails or times out is closed before returning.
pub(crate) async fn establish<T: Transport>(
    transport: &T,
    target: &str,
    ctx: &CallContext,
    timeout: Duration,
    span: &Span,
) -> Result<T::Handle, ConnectError> {
    let ctx = ctx.with_timeout(timeout);
    let budget = ctx.remaining().unwrap_or(timeout);

    let handle = transport.dial(target)?;
    handle.connect();
    debug!(parent: span, target, "waiting for connection to become ready");

    loop {
        let state = handle.state();
        if state == ConnectivityState::Ready {
            info!(parent: span, target, "connected");
            return Ok(handle);
        }

        if !handle.wait_for_state_change(&ctx, state).await {
            close_quietly(&handle, span).await;
            let err = match ctx.check() {
                Err(ContextError::Cancelled) => ConnectError::Cancelled(ContextError::Cancelled),
                _ => ConnectError::Timeout {
                    target: target.to_string(),
                    timeout: budget,
                },
            };
            error!(parent: span, target, error = %err, "connection did not become ready");
            return Err(err);
        }

        let current = handle.state();
        debug!(parent: span, target, from = %state, to = %current, "connectivity state changed");

        if current.is_failed() {
            close_quietly(&handle, span).await;
            error!(parent: span, target, state = %current, "connection failed");
            return Err(ConnectError::Failed {
                target: target.to_string(),
                state: current,
            });
        }
    }
}

pub(crate) async fn close_quietly<H: TransportHandle>(handle: &H, span: &Span) {
    if let Err(err) = handle.close().await {
        warn!(parent: span, target = handle.target(), error = %err, "error while closing connection");
    }
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<G>(lock: &RwLock<G>) -> RwLockReadGuard<'_, G> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<G>(lock: &RwLock<G>) -> RwLockWriteGuard<'_, G> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct ManagerInner<T: Transport> {
    transport: Arc<T>,
    target: RwLock<String>,
    reconnect_timeout: Duration,
    /// Serializes connect and reconnect
    connect_lock: tokio::sync::Mutex<()>,
    handle: RwLock<Option<Arc<T::Handle>>>,
    health: Mutex<Option<HealthChecker<T>>>,
    span: Span,
}

/// Owns one connection to one target and re-establishes it on demand
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tether_connect::testing::MockTransport;
/// use tether_connect::{ConnectionManager, ManagerConfig};
///
/// # async fn example() -> Result<(), tether_connect::ConnectError> {
/// let manager = ConnectionManager::connect(
///     Arc::new(MockTransport::new()),
///     ManagerConfig::new("10.0.0.5:50051"),
/// )
/// .await?;
///
/// if let Some(handle) = manager.handle() {
///     // issue calls on the handle...
/// #   let _ = handle;
/// }
///
/// manager.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<T: Transport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Connect to `config.target`, waiting up to `connect_timeout` for readiness
    ///
    /// Starts a health checker when `config.health_check` is enabled with a
    /// non-zero interval.
    pub async fn connect(transport: Arc<T>, config: ManagerConfig) -> Result<Self, ConnectError> {
        Self::connect_with_span(transport, config, Span::none()).await
    }

    /// Like [`connect`](Self::connect), logging under `span`
    pub async fn connect_with_span(
        transport: Arc<T>,
        config: ManagerConfig,
        span: Span,
    ) -> Result<Self, ConnectError> {
        if config.target.is_empty() {
            return Err(ConnectError::EmptyTarget);
        }

        let manager = Self {
            inner: Arc::new(ManagerInner {
                transport,
                target: RwLock::new(config.target.clone()),
                reconnect_timeout: config.reconnect_timeout,
                connect_lock: tokio::sync::Mutex::new(()),
                handle: RwLock::new(None),
                health: Mutex::new(None),
                span,
            }),
        };

        {
            let _guard = manager.inner.connect_lock.lock().await;
            let handle = establish(
                &*manager.inner.transport,
                &config.target,
                &CallContext::background(),
                config.connect_timeout,
                &manager.inner.span,
            )
            .await?;
            *write(&manager.inner.handle) = Some(Arc::new(handle));
        }

        let health = config.health_check;
        if health.enabled && !health.interval.is_zero() {
            manager.start_health_check(health.interval).await;
        }

        Ok(manager)
    }

    /// Close the current connection and establish a new one
    ///
    /// `new_target` switches the target when given and non-empty. The attempt is
    /// bounded by the context deadline, or by `reconnect_timeout` when the context
    /// has none. On failure no handle is held and [`state`](Self::state) reports
    /// `Shutdown`.
    pub async fn reconnect(&self, ctx: &CallContext, new_target: Option<&str>) -> Result<(), ConnectError> {
        let _guard = self.inner.connect_lock.lock().await;

        if let Some(target) = new_target.filter(|target| !target.is_empty()) {
            *write(&self.inner.target) = target.to_string();
        }
        let target = self.target();

        let previous = write(&self.inner.handle).take();
        if let Some(previous) = previous {
            close_quietly(&*previous, &self.inner.span).await;
        }

        info!(parent: &self.inner.span, target = %target, "reconnecting");
        let timeout = ctx.remaining().unwrap_or(self.inner.reconnect_timeout);
        let handle = establish(&*self.inner.transport, &target, ctx, timeout, &self.inner.span).await?;
        *write(&self.inner.handle) = Some(Arc::new(handle));

        Ok(())
    }

    /// Connectivity of the held handle; `Shutdown` when none is held
    pub fn state(&self) -> ConnectivityState {
        match read(&self.inner.handle).as_ref() {
            Some(handle) => handle.state(),
            None => ConnectivityState::Shutdown,
        }
    }

    /// Borrow the current handle for a call
    pub fn handle(&self) -> Option<Arc<T::Handle>> {
        read(&self.inner.handle).clone()
    }

    pub fn target(&self) -> String {
        read(&self.inner.target).clone()
    }

    pub fn reconnect_timeout(&self) -> Duration {
        self.inner.reconnect_timeout
    }

    /// Stop health checking and close the connection. Idempotent.
    pub async fn close(&self) -> Result<(), ConnectError> {
        self.stop_health_check().await;

        let _guard = self.inner.connect_lock.lock().await;
        let handle = write(&self.inner.handle).take();
        match handle {
            Some(handle) => {
                info!(parent: &self.inner.span, target = handle.target(), "closing connection");
                handle.close().await
            }
            None => Ok(()),
        }
    }

    /// Start (or restart) the owned health checker
    pub async fn start_health_check(&self, interval: Duration) {
        self.stop_health_check().await;

        let checker = HealthChecker::new(self, interval);
        checker.start();
        *lock(&self.inner.health) = Some(checker);
    }

    pub async fn stop_health_check(&self) {
        let checker = lock(&self.inner.health).take();
        if let Some(checker) = checker {
            checker.stop().await;
        }
    }

    /// The owned health checker, if health checking is on
    pub fn health_checker(&self) -> Option<HealthChecker<T>> {
        lock(&self.inner.health).clone()
    }

    /// Register a callback on the owned health checker
    ///
    /// Returns `false` when health checking is off.
    pub fn set_reconnect_callback<F>(&self, callback: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        match lock(&self.inner.health).as_ref() {
            Some(checker) => {
                checker.set_reconnect_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Weak reference that does not keep the manager alive
    pub fn downgrade(&self) -> WeakConnectionManager<T> {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn span(&self) -> &Span {
        &self.inner.span
    }
}

/// Non-owning reference to a [`ConnectionManager`]
pub struct WeakConnectionManager<T: Transport> {
    inner: Weak<ManagerInner<T>>,
}

impl<T: Transport> WeakConnectionManager<T> {
    pub fn upgrade(&self) -> Option<ConnectionManager<T>> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl<T: Transport> Clone for WeakConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.target())
            .field("state", &self.state())
            .finish()
    }
}
