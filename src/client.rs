/*!
 * TetherClient: a transport wrapped in the full resilience stack
 *
 * The client owns either a single managed connection (with optional health
 * checking) or a connection pool, and runs every call through a
 * [`CallPipeline`]. A connection is obtained per attempt, so a retry after a
 * reconnection picks up the new handle.
 *
 * Failing to obtain a connection counts as an attempt failure for retry and
 * breaker purposes. If the last attempt failed that way, the call surfaces
 * the connection error ([`CallError::Connect`] or [`CallError::Pool`])
 * rather than a synthesized status.
 */

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_connect::{connect_pool, ConnectError, ConnectionManager, ConnectivityState, Transport, TransportPool};
use tether_core_resilience::{
    CallContext, CircuitBreaker, ContextError, PoolStats, RateLimiter, ResilienceError,
};
use tracing::{info, warn, Span};

use crate::config::{ConnectionMode, TetherConfig};
use crate::error::{CallError, Result};
use crate::logging::component_span;
use crate::metrics::MetricsCollector;
use crate::pipeline::CallPipeline;

enum Connections<T: Transport> {
    Single(ConnectionManager<T>),
    Pool(TransportPool<T>),
}

/// Resilient client over transport `T`
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tether::{CallContext, TetherClient, TetherConfig};
/// use tether_connect::testing::MockTransport;
/// use tether_connect::{ConnectivityState, TransportHandle};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TetherConfig::for_target("10.0.0.5:50051");
/// let client = TetherClient::connect(Arc::new(MockTransport::new()), config).await?;
///
/// let state = client
///     .call(&CallContext::background(), |handle| async move {
///         match handle.state() {
///             ConnectivityState::Ready => Ok(handle.target().to_string()),
///             state => Err(tonic::Status::unavailable(format!("connection is {}", state))),
///         }
///     })
///     .await?;
///
/// println!("{} / {}", state, client.metrics().stats().summary());
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct TetherClient<T: Transport> {
    connections: Connections<T>,
    pipeline: CallPipeline,
    request_timeout: Option<Duration>,
    target: String,
    span: Span,
}

impl<T: Transport> TetherClient<T> {
    /// Validate `config`, connect, and assemble the pipeline
    pub async fn connect(transport: Arc<T>, config: TetherConfig) -> Result<Self> {
        config.validate()?;

        let target = config.connection.target.clone();
        let span = component_span("client", &target);

        let connections = match config.connection.mode {
            ConnectionMode::Single => Connections::Single(
                ConnectionManager::connect_with_span(transport, config.manager_config(), span.clone()).await?,
            ),
            ConnectionMode::Pool => Connections::Pool(
                connect_pool(
                    transport,
                    &target,
                    Duration::from_millis(config.connection.connect_timeout_ms),
                    config.pool_config(),
                    span.clone(),
                )
                .await?,
            ),
        };

        info!(parent: &span, mode = ?config.connection.mode, "client ready");

        Ok(Self {
            connections,
            pipeline: CallPipeline::from_config(&config, span.clone()),
            request_timeout: config.request_timeout(),
            target,
            span,
        })
    }

    /// Run `f` against a connection under the resilience pipeline
    ///
    /// `f` is invoked once per attempt with the handle current at that
    /// moment. In pool mode the connection goes back to the pool after each
    /// attempt.
    pub async fn call<R, F, Fut>(&self, ctx: &CallContext, f: F) -> std::result::Result<R, CallError>
    where
        F: Fn(Arc<T::Handle>) -> Fut,
        Fut: Future<Output = std::result::Result<R, tonic::Status>>,
    {
        let ctx = match self.request_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        };

        // Why the latest attempt could not get a connection, if it could not
        let acquire_failure: Mutex<Option<CallError>> = Mutex::new(None);

        let f = &f;
        let call_ctx = &ctx;
        let connections = &self.connections;
        let target = self.target.as_str();
        let span = &self.span;
        let failure_slot = &acquire_failure;

        let result = self
            .pipeline
            .call(&ctx, move || async move {
                record_acquire_failure(failure_slot, None);
                match connections {
                    Connections::Single(manager) => {
                        let Some(handle) = manager.handle() else {
                            let err = ConnectError::Failed {
                                target: target.to_string(),
                                state: manager.state(),
                            };
                            let status = tonic::Status::unavailable(err.to_string());
                            record_acquire_failure(failure_slot, Some(CallError::Connect(err)));
                            return Err(status);
                        };
                        f(handle).await
                    }
                    Connections::Pool(pool) => {
                        let conn = match pool.get(call_ctx).await {
                            Ok(conn) => conn,
                            Err(err) => {
                                let status = status_from_pool_error(&err);
                                record_acquire_failure(failure_slot, Some(CallError::from(err)));
                                return Err(status);
                            }
                        };
                        let result = f(Arc::clone(&*conn)).await;
                        if let Err(err) = pool.put(conn).await {
                            warn!(parent: span, error = %err, "failed to return connection to pool");
                        }
                        result
                    }
                }
            })
            .await;

        let acquire_failure = acquire_failure.into_inner().unwrap_or_else(PoisonError::into_inner);
        result.map_err(|err| match (err, acquire_failure) {
            (CallError::Status(_) | CallError::RetryExhausted { .. }, Some(acquire)) => acquire,
            (err, _) => err,
        })
    }

    /// Connectivity of the client
    ///
    /// In pool mode: `Shutdown` once closed, `Ready` while the pool holds any
    /// connection, `Idle` otherwise.
    pub fn state(&self) -> ConnectivityState {
        match &self.connections {
            Connections::Single(manager) => manager.state(),
            Connections::Pool(pool) => {
                if pool.is_closed() {
                    ConnectivityState::Shutdown
                } else if pool.stats().total > 0 {
                    ConnectivityState::Ready
                } else {
                    ConnectivityState::Idle
                }
            }
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        match &self.connections {
            Connections::Single(_) => ConnectionMode::Single,
            Connections::Pool(_) => ConnectionMode::Pool,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.pipeline.metrics()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.pipeline.circuit_breaker()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.pipeline.rate_limiter()
    }

    pub fn pipeline(&self) -> &CallPipeline {
        &self.pipeline
    }

    /// The managed connection in single mode
    pub fn manager(&self) -> Option<&ConnectionManager<T>> {
        match &self.connections {
            Connections::Single(manager) => Some(manager),
            Connections::Pool(_) => None,
        }
    }

    /// Pool occupancy in pool mode
    pub fn pool_stats(&self) -> Option<PoolStats> {
        match &self.connections {
            Connections::Single(_) => None,
            Connections::Pool(pool) => Some(pool.stats()),
        }
    }

    /// Re-establish connectivity now
    ///
    /// Single mode replaces the managed connection. Pool mode runs a health
    /// pass, evicting broken connections and topping the idle set back up.
    pub async fn reconnect(&self, ctx: &CallContext) -> std::result::Result<(), ConnectError> {
        match &self.connections {
            Connections::Single(manager) => manager.reconnect(ctx, None).await,
            Connections::Pool(pool) => {
                if pool.is_closed() {
                    return Err(ConnectError::Pool(ResilienceError::PoolClosed));
                }
                pool.run_health_pass().await;
                Ok(())
            }
        }
    }

    /// Stop background work and close every connection. Idempotent.
    pub async fn close(&self) -> std::result::Result<(), ConnectError> {
        info!(parent: &self.span, "closing client");
        match &self.connections {
            Connections::Single(manager) => manager.close().await,
            Connections::Pool(pool) => {
                pool.close().await;
                Ok(())
            }
        }
    }
}

fn record_acquire_failure(slot: &Mutex<Option<CallError>>, failure: Option<CallError>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = failure;
}

/// Express a pool acquisition failure as a status the retry layer can classify
fn status_from_pool_error(err: &ResilienceError) -> tonic::Status {
    let message = err.to_string();
    match err {
        ResilienceError::AcquireTimeout(_) => tonic::Status::resource_exhausted(message),
        ResilienceError::ConnectionCreation(_) => tonic::Status::unavailable(message),
        ResilienceError::Context(ContextError::DeadlineExceeded) => tonic::Status::deadline_exceeded(message),
        ResilienceError::Context(ContextError::Cancelled) => tonic::Status::cancelled(message),
        _ => tonic::Status::failed_precondition(message),
    }
}

impl<T: Transport> fmt::Debug for TetherClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TetherClient")
            .field("target", &self.target)
            .field("mode", &self.mode())
            .field("state", &self.state())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_connect::testing::{DialBehavior, MockHandle, MockTransport};
    use tether_connect::TransportHandle;
    use tether_core_resilience::CircuitState;

    fn config(mode: ConnectionMode) -> TetherConfig {
        let mut config = TetherConfig::for_target("svc:50051");
        config.connection.mode = mode;
        config.connection.connect_timeout_ms = 200;
        config.health_check.enabled = false;
        config.pool.enable_health_check = false;
        config.retry.backoff_base_ms = 10;
        config
    }

    async fn ready_call(handle: Arc<MockHandle>) -> std::result::Result<String, tonic::Status> {
        match handle.state() {
            ConnectivityState::Ready => Ok(handle.target().to_string()),
            state => Err(tonic::Status::unavailable(format!("connection is {}", state))),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_dialing() {
        let transport = Arc::new(MockTransport::new());
        let result = TetherClient::connect(Arc::clone(&transport), TetherConfig::default()).await;

        assert!(matches!(result, Err(crate::error::TetherError::Config(_))));
        assert_eq!(transport.dial_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_surfaces() {
        let transport = Arc::new(MockTransport::with_behavior(DialBehavior::Hang));
        let result = TetherClient::connect(transport, config(ConnectionMode::Single)).await;

        assert!(matches!(
            result,
            Err(crate::error::TetherError::Connect(ConnectError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn test_single_mode_call() {
        let transport = Arc::new(MockTransport::new());
        let client = TetherClient::connect(transport, config(ConnectionMode::Single)).await.unwrap();

        let target = client.call(&CallContext::background(), ready_call).await.unwrap();

        assert_eq!(target, "svc:50051");
        assert_eq!(client.mode(), ConnectionMode::Single);
        assert_eq!(client.state(), ConnectivityState::Ready);
        assert_eq!(client.metrics().stats().success_count, 1);
        assert!(client.pool_stats().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_picks_up_reconnected_handle() {
        let transport = Arc::new(MockTransport::new());
        let client = TetherClient::connect(Arc::clone(&transport), config(ConnectionMode::Single))
            .await
            .unwrap();
        client.manager().unwrap().handle().unwrap().set_state(ConnectivityState::TransientFailure);

        let attempts = AtomicU32::new(0);
        let result = client
            .call(&CallContext::background(), |handle| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let manager = client.manager().unwrap().clone();
                async move {
                    if attempt == 0 {
                        // Out-of-band recovery between attempts
                        manager.reconnect(&CallContext::background(), None).await.ok();
                    }
                    ready_call(handle).await
                }
            })
            .await;

        assert_eq!(result.unwrap(), "svc:50051");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(transport.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_mode_returns_connections() {
        let transport = Arc::new(MockTransport::new());
        let client = TetherClient::connect(Arc::clone(&transport), config(ConnectionMode::Pool))
            .await
            .unwrap();

        for _ in 0..5 {
            client.call(&CallContext::background(), ready_call).await.unwrap();
        }

        let stats = client.pool_stats().unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 2);
        assert_eq!(transport.dial_count(), 2);
        assert_eq!(client.state(), ConnectivityState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_on_persistent_failure() {
        let transport = Arc::new(MockTransport::new());
        let mut config = config(ConnectionMode::Single);
        config.retry.max_retries = 0;
        config.circuit_breaker.failure_threshold = 2;
        let client = TetherClient::connect(transport, config).await.unwrap();

        let failing = |_handle: Arc<MockHandle>| async { Err::<(), _>(tonic::Status::unavailable("down")) };
        for _ in 0..2 {
            assert!(client.call(&CallContext::background(), failing).await.is_err());
        }

        let err = client.call(&CallContext::background(), failing).await.unwrap_err();
        assert!(matches!(err, CallError::CircuitOpen));
        assert_eq!(client.circuit_breaker().unwrap().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_bounds_call() {
        let transport = Arc::new(MockTransport::new());
        let mut config = config(ConnectionMode::Single);
        config.connection.request_timeout_ms = 100;
        config.retry.max_retries = 10;
        config.retry.backoff = crate::config::BackoffKind::Fixed;
        config.retry.retry_delay_ms = 60;
        let client = TetherClient::connect(transport, config).await.unwrap();

        let err = client
            .call(&CallContext::background(), |_handle| async {
                Err::<(), _>(tonic::Status::unavailable("down"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Cancelled(ContextError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_pool_call_does_not_leak_capacity() {
        let transport = Arc::new(MockTransport::new());
        let mut config = config(ConnectionMode::Pool);
        config.pool.initial_size = 1;
        config.pool.max_size = 1;
        let client = TetherClient::connect(Arc::clone(&transport), config).await.unwrap();

        let slow_ctx = CallContext::background();
        let slow = client.call(&slow_ctx, |handle| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ready_call(handle).await
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let target = client.call(&CallContext::background(), ready_call).await.unwrap();
        assert_eq!(target, "svc:50051");

        let stats = client.pool_stats().unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 1);
        assert_eq!(transport.dial_count(), 2);
        assert_eq!(transport.open_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_connection_surfaces_connect_error() {
        let transport = Arc::new(MockTransport::new());
        let client = TetherClient::connect(Arc::clone(&transport), config(ConnectionMode::Single))
            .await
            .unwrap();

        transport.set_default(DialBehavior::Reject);
        assert!(client.reconnect(&CallContext::background()).await.is_err());
        assert!(client.manager().unwrap().handle().is_none());

        let err = client.call(&CallContext::background(), ready_call).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Connect(ConnectError::Failed {
                state: ConnectivityState::Shutdown,
                ..
            })
        ));
        assert_eq!(client.metrics().stats().failure_count, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_surfaces_pool_error() {
        let transport = Arc::new(MockTransport::new());
        let client = TetherClient::connect(Arc::clone(&transport), config(ConnectionMode::Pool))
            .await
            .unwrap();
        client.close().await.unwrap();

        let err = client.call(&CallContext::background(), ready_call).await.unwrap_err();
        assert!(matches!(err, CallError::Pool(ResilienceError::PoolClosed)));
        assert!(!err.is_admission_rejection());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let client = TetherClient::connect(Arc::clone(&transport), config(ConnectionMode::Pool))
            .await
            .unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(client.state(), ConnectivityState::Shutdown);
        assert_eq!(transport.open_handles(), 0);
        assert!(client.reconnect(&CallContext::background()).await.is_err());
    }
}
