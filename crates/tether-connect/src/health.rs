//! Background liveness monitor for a [`ConnectionManager`]
//!
//! While running, the checker samples the manager's connectivity state on a
//! fixed interval. A `TransientFailure` or `Shutdown` state triggers a
//! reconnection; failures are logged and counted and never stop the loop.
//!
//! The checker holds only a weak reference to its manager, so it never keeps
//! the manager alive. Once the manager is dropped the loop exits on its own.

use crate::manager::{ConnectionManager, WeakConnectionManager};
use crate::transport::{ConnectivityState, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tether_core_resilience::CallContext;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

/// Interval used when a zero interval is requested
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Health checking settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }
}

impl HealthCheckConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Invoked after each successful reconnection
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Counters since the checker was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub checks: u64,
    pub reconnect_attempts: u64,
    pub reconnect_failures: u64,
}

impl HealthStats {
    pub fn reconnect_successes(&self) -> u64 {
        self.reconnect_attempts.saturating_sub(self.reconnect_failures)
    }
}

/// Result of a single health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Connection was usable; carries the observed state
    Healthy(ConnectivityState),
    Reconnected,
    ReconnectFailed,
    /// The manager no longer exists
    ManagerDropped,
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct CheckerInner<T: Transport> {
    manager: WeakConnectionManager<T>,
    interval: Duration,
    reconnect_timeout: Duration,
    on_reconnect: RwLock<Option<ReconnectCallback>>,
    running: Mutex<Option<Running>>,
    checks: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_failures: AtomicU64,
    span: Span,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodically verifies a manager's connection and reconnects it
pub struct HealthChecker<T: Transport> {
    inner: Arc<CheckerInner<T>>,
}

impl<T: Transport> Clone for HealthChecker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> HealthChecker<T> {
    /// Create a stopped checker for `manager`
    ///
    /// A zero `interval` falls back to [`DEFAULT_HEALTH_CHECK_INTERVAL`].
    pub fn new(manager: &ConnectionManager<T>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_HEALTH_CHECK_INTERVAL
        } else {
            interval
        };

        Self {
            inner: Arc::new(CheckerInner {
                manager: manager.downgrade(),
                interval,
                reconnect_timeout: manager.reconnect_timeout(),
                on_reconnect: RwLock::new(None),
                running: Mutex::new(None),
                checks: AtomicU64::new(0),
                reconnect_attempts: AtomicU64::new(0),
                reconnect_failures: AtomicU64::new(0),
                span: manager.span().clone(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Replace the callback invoked after a successful reconnection
    pub fn set_reconnect_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .inner
            .on_reconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Start the background loop. No-op if already running.
    pub fn start(&self) {
        let mut running = lock(&self.inner.running);
        if running.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&self.inner), shutdown.clone()));
        *running = Some(Running { shutdown, task });

        info!(parent: &self.inner.span, interval = ?self.inner.interval, "health checker started");
    }

    /// Stop the background loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let running = lock(&self.inner.running).take();
        let Some(running) = running else {
            return;
        };

        running.shutdown.cancel();
        if let Err(err) = running.task.await {
            warn!(parent: &self.inner.span, error = %err, "health checker task ended abnormally");
        }
        info!(parent: &self.inner.span, "health checker stopped");
    }

    /// Whether the background loop is alive
    pub fn is_running(&self) -> bool {
        lock(&self.inner.running)
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Run one check inline
    pub async fn check_now(&self) -> CheckOutcome {
        self.inner.check(&CallContext::background()).await
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            checks: self.inner.checks.load(Ordering::Relaxed),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_failures: self.inner.reconnect_failures.load(Ordering::Relaxed),
        }
    }
}

async fn run<T: Transport>(inner: Arc<CheckerInner<T>>, shutdown: CancellationToken) {
    let period = inner.interval;
    // An interval too long to schedule never fires
    let Some(first_tick) = Instant::now().checked_add(period) else {
        shutdown.cancelled().await;
        return;
    };
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Stopping the checker also abandons a reconnection in progress
    let ctx = CallContext::from_token(shutdown.clone());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if inner.check(&ctx).await == CheckOutcome::ManagerDropped {
                    debug!(parent: &inner.span, "manager dropped, health checker exiting");
                    break;
                }
            }
        }
    }
}

impl<T: Transport> CheckerInner<T> {
    async fn check(&self, ctx: &CallContext) -> CheckOutcome {
        let Some(manager) = self.manager.upgrade() else {
            return CheckOutcome::ManagerDropped;
        };

        self.checks.fetch_add(1, Ordering::Relaxed);
        let state = manager.state();
        debug!(parent: &self.span, state = %state, "health check");

        if !state.is_failed() {
            return CheckOutcome::Healthy(state);
        }

        info!(parent: &self.span, state = %state, target = %manager.target(), "connection unhealthy, reconnecting");
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);

        let ctx = ctx.with_timeout(self.reconnect_timeout);
        match manager.reconnect(&ctx, None).await {
            Ok(()) => {
                info!(parent: &self.span, target = %manager.target(), "reconnected");
                let callback = self
                    .on_reconnect
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(callback) = callback {
                    callback();
                }
                CheckOutcome::Reconnected
            }
            Err(err) => {
                self.reconnect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(parent: &self.span, error = %err, "reconnect failed");
                CheckOutcome::ReconnectFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::testing::{DialBehavior, MockTransport};
    use std::sync::atomic::AtomicUsize;

    async fn manager(transport: &Arc<MockTransport>, health: HealthCheckConfig) -> ConnectionManager<MockTransport> {
        ConnectionManager::connect(
            Arc::clone(transport),
            ManagerConfig {
                target: "svc:50051".to_string(),
                connect_timeout: Duration::from_millis(500),
                reconnect_timeout: Duration::from_millis(500),
                health_check: health,
            },
        )
        .await
        .unwrap()
    }

    fn break_current(transport: &MockTransport) {
        if let Some(handle) = transport.handles().last() {
            handle.set_state(ConnectivityState::TransientFailure);
        }
    }

    #[tokio::test]
    async fn test_healthy_connection_is_left_alone() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport, HealthCheckConfig::disabled()).await;
        let checker = HealthChecker::new(&manager, Duration::from_secs(1));

        assert_eq!(
            checker.check_now().await,
            CheckOutcome::Healthy(ConnectivityState::Ready)
        );
        assert_eq!(checker.stats().checks, 1);
        assert_eq!(checker.stats().reconnect_attempts, 0);
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_connection_is_reconnected() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport, HealthCheckConfig::disabled()).await;
        let checker = HealthChecker::new(&manager, Duration::from_secs(1));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        checker.set_reconnect_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        break_current(&transport);
        assert_eq!(checker.check_now().await, CheckOutcome::Reconnected);

        assert_eq!(manager.state(), ConnectivityState::Ready);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(transport.dial_count(), 2);
        assert_eq!(checker.stats().reconnect_successes(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_counted_not_fatal() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport, HealthCheckConfig::disabled()).await;
        let checker = HealthChecker::new(&manager, Duration::from_secs(1));

        transport.push_behavior(DialBehavior::Reject);
        break_current(&transport);

        assert_eq!(checker.check_now().await, CheckOutcome::ReconnectFailed);
        assert_eq!(manager.state(), ConnectivityState::Shutdown);

        // Next check retries with the default (ready) behavior
        assert_eq!(checker.check_now().await, CheckOutcome::Reconnected);
        let stats = checker.stats();
        assert_eq!(stats.reconnect_attempts, 2);
        assert_eq!(stats.reconnect_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_reconnects() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(
            &transport,
            HealthCheckConfig {
                enabled: true,
                interval: Duration::from_secs(1),
            },
        )
        .await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        assert!(manager.set_reconnect_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        break_current(&transport);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(manager.state(), ConnectivityState::Ready);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        manager.close().await.unwrap();
        assert!(manager.health_checker().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport, HealthCheckConfig::disabled()).await;
        let checker = HealthChecker::new(&manager, Duration::from_secs(1));

        checker.start();
        checker.start();
        assert!(checker.is_running());

        checker.stop().await;
        checker.stop().await;
        assert!(!checker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_when_manager_dropped() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport, HealthCheckConfig::disabled()).await;
        let checker = HealthChecker::new(&manager, Duration::from_secs(1));
        checker.start();

        drop(manager);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!checker.is_running());
        assert_eq!(checker.check_now().await, CheckOutcome::ManagerDropped);
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_uses_default() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport, HealthCheckConfig::disabled()).await;
        let checker = HealthChecker::new(&manager, Duration::ZERO);
        assert_eq!(checker.interval(), DEFAULT_HEALTH_CHECK_INTERVAL);
    }
}
