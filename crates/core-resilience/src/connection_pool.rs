//! Generic connection pool for reusable connections
//!
//! Provides bounded connection reuse with an idle queue, health checking on
//! hand-out and hand-back, and a periodic health pass that evicts stale idle
//! connections and keeps a minimum number warm.
//!
//! The number of live connections (idle plus handed out) never exceeds
//! `max_size`: a slot is reserved with a compare-and-swap before a connection is
//! created and refunded if creation fails. A handed-out connection that is
//! dropped instead of returned is closed and its slot refunded.

use super::context::{sleep_until, CallContext, ContextError};
use super::error::ResilienceError;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections created up front
    pub initial_size: usize,
    /// Maximum number of live connections
    pub max_size: usize,
    /// Idle connections the health pass tops up to
    pub min_idle: usize,
    /// Maximum time a connection can remain idle before the health pass closes it
    pub max_idle: Duration,
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
    pub enable_health_check: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 2,
            max_size: 10,
            min_idle: 1,
            max_idle: Duration::from_secs(300), // 5 minutes
            acquire_timeout: Duration::from_secs(3),
            health_check_interval: Duration::from_secs(30),
            enable_health_check: true,
        }
    }
}

impl PoolConfig {
    /// Bring sizes into range: `max_size >= 1`, `initial_size` and `min_idle` at most `max_size`
    pub fn clamped(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self.initial_size = self.initial_size.min(self.max_size);
        self.min_idle = self.min_idle.min(self.max_size);
        self
    }
}

/// A connection checked out of (or idle in) a [`ConnectionPool`]
///
/// Dereferences to the underlying connection. Hand it back with
/// [`ConnectionPool::put`] to keep it for reuse. Dropping it instead closes
/// the connection through the factory (on a spawned task when a runtime is
/// available) and frees its slot.
pub struct PooledConnection<T: Send + 'static> {
    /// Only empty once the connection has been closed or handed off
    conn: Option<T>,
    pool_id: u64,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    home: Weak<PoolInner<T>>,
}

impl<T: Send + 'static> PooledConnection<T> {
    fn new(conn: T, pool_id: u64, home: Weak<PoolInner<T>>) -> Self {
        let now = Instant::now();
        Self {
            conn: Some(conn),
            pool_id,
            created_at: now,
            last_used: now,
            in_use: false,
            home,
        }
    }

    /// Time since the connection was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last handed out or returned
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// Identifier of the pool that created this connection
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    fn check_out(&mut self) {
        self.in_use = true;
        self.last_used = Instant::now();
    }

    fn check_in(&mut self) {
        self.in_use = false;
        self.last_used = Instant::now();
    }
}

impl<T: Send + 'static> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn.as_ref().expect("pooled connection accessed after close")
    }
}

impl<T: Send + 'static> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("pooled connection accessed after close")
    }
}

impl<T: Send + 'static> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let Some(inner) = self.home.upgrade() else { return };

        tracing::debug!(parent: &inner.span, "pooled connection dropped without being returned");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    inner.factory.close(conn).await;
                    inner.release_slot();
                });
            }
            Err(_) => {
                drop(conn);
                inner.release_slot();
            }
        }
    }
}

impl<T: Send + Debug + 'static> Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("pool_id", &self.pool_id)
            .field("in_use", &self.in_use)
            .finish()
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check if a connection is still healthy
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;

struct PoolInner<T: Send + 'static> {
    id: u64,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    idle: Mutex<VecDeque<PooledConnection<T>>>,
    available: Notify,
    live: AtomicUsize,
    closed: AtomicBool,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    span: Span,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> PoolInner<T> {
    /// Give back the slot of a connection that is gone
    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.available.notify_one();
    }
}

impl<T: Send + Sync + 'static> PoolInner<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pop_idle(&self) -> Option<PooledConnection<T>> {
        lock(&self.idle).pop_front()
    }

    /// Reserve one slot of capacity, failing if the pool is full
    fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_size).then_some(live + 1)
            })
            .is_ok()
    }

    /// Close a connection that holds a slot and give the slot back
    async fn discard(&self, mut pooled: PooledConnection<T>) {
        if let Some(conn) = pooled.conn.take() {
            self.factory.close(conn).await;
        }
        self.release_slot();
    }

    /// Create a connection into an already reserved slot
    async fn create_reserved(self: &Arc<Self>) -> Result<PooledConnection<T>, ResilienceError> {
        match self.factory.create().await {
            Ok(conn) => Ok(PooledConnection::new(conn, self.id, Arc::downgrade(self))),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Push onto the idle queue; hands the connection back if the queue is full
    fn push_idle(&self, pooled: PooledConnection<T>) -> Option<PooledConnection<T>> {
        let mut idle = lock(&self.idle);
        if idle.len() >= self.config.max_size {
            return Some(pooled);
        }
        idle.push_back(pooled);
        drop(idle);
        self.available.notify_one();
        None
    }

    async fn health_pass(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }

        let drained: Vec<_> = lock(&self.idle).drain(..).collect();
        let checked = drained.len();
        let mut evicted = 0usize;
        let mut kept = Vec::with_capacity(drained.len());

        for pooled in drained {
            let stale = pooled.idle_time() > self.config.max_idle;
            if stale || kept.len() >= self.config.max_size || !self.factory.is_healthy(&pooled).await {
                evicted += 1;
                self.discard(pooled).await;
            } else {
                kept.push(pooled);
            }
        }

        for pooled in kept {
            if let Some(overflow) = self.push_idle(pooled) {
                evicted += 1;
                self.discard(overflow).await;
            }
        }

        let idle_now = lock(&self.idle).len();
        let mut created = 0usize;
        for _ in idle_now..self.config.min_idle {
            if self.is_closed() || !self.try_reserve() {
                break;
            }
            match self.create_reserved().await {
                Ok(pooled) => {
                    created += 1;
                    if let Some(overflow) = self.push_idle(pooled) {
                        self.discard(overflow).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(parent: &self.span, error = %err, "failed to replenish idle connection");
                    break;
                }
            }
        }

        tracing::debug!(
            parent: &self.span,
            checked,
            evicted,
            created,
            live = self.live.load(Ordering::Acquire),
            "pool health pass complete"
        );
    }
}

/// A bounded pool of reusable connections
///
/// # Example
/// ```no_run
/// use tether_core_resilience::{CallContext, ConnectionFactory, ConnectionPool, PoolConfig, ResilienceError};
/// use std::sync::Arc;
///
/// # #[derive(Debug)]
/// # struct MyConnection { id: usize }
/// struct MyConnectionFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<MyConnection> for MyConnectionFactory {
///     async fn create(&self) -> Result<MyConnection, ResilienceError> {
///         Ok(MyConnection { id: 1 })
///     }
///
///     async fn is_healthy(&self, _conn: &MyConnection) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(Arc::new(MyConnectionFactory), PoolConfig::default()).await?;
///
/// let conn = pool.get(&CallContext::background()).await?;
/// println!("using connection {}", conn.id);
/// pool.put(conn).await?;
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> ConnectionPool<T> {
    /// Create a new connection pool
    ///
    /// Opens `initial_size` connections; if any of them fails, the ones already
    /// opened are closed and the error is returned. Starts the health pass task
    /// when enabled.
    pub async fn new(
        factory: Arc<dyn ConnectionFactory<T>>,
        config: PoolConfig,
    ) -> Result<Self, ResilienceError> {
        Self::with_span(factory, config, Span::none()).await
    }

    /// Create a connection pool with default configuration
    pub async fn new_default(factory: Arc<dyn ConnectionFactory<T>>) -> Result<Self, ResilienceError> {
        Self::new(factory, PoolConfig::default()).await
    }

    /// Create a pool whose logs are emitted under `span`
    pub async fn with_span(
        factory: Arc<dyn ConnectionFactory<T>>,
        config: PoolConfig,
        span: Span,
    ) -> Result<Self, ResilienceError> {
        let config = config.clamped();
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            factory,
            idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
            available: Notify::new(),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
            close_callbacks: Mutex::new(Vec::new()),
            span,
            config,
        });
        let pool = Self { inner };

        for _ in 0..pool.inner.config.initial_size {
            let created = if pool.inner.try_reserve() {
                pool.inner.create_reserved().await
            } else {
                Err(ResilienceError::ConnectionCreation(
                    "pool capacity exhausted during warm-up".to_string(),
                ))
            };

            match created {
                Ok(pooled) => {
                    if let Some(overflow) = pool.inner.push_idle(pooled) {
                        pool.inner.discard(overflow).await;
                    }
                }
                Err(err) => {
                    tracing::error!(parent: &pool.inner.span, error = %err, "failed to initialise connection pool");
                    pool.close().await;
                    return Err(err);
                }
            }
        }

        let config = &pool.inner.config;
        if config.enable_health_check && !config.health_check_interval.is_zero() {
            let handle = spawn_health_task(&pool.inner);
            *lock(&pool.inner.health_task) = Some(handle);
        }

        tracing::info!(
            parent: &pool.inner.span,
            initial = config.initial_size,
            max = config.max_size,
            "connection pool created"
        );

        Ok(pool)
    }

    /// Pool configuration after clamping
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection
    ///
    /// Reuses a healthy idle connection, otherwise creates one if capacity
    /// allows, otherwise waits for a connection to be returned. The wait is
    /// bounded by the earlier of `acquire_timeout` and the context deadline.
    pub async fn get(&self, ctx: &CallContext) -> Result<PooledConnection<T>, ResilienceError> {
        let inner = &self.inner;
        let deadline = ctx.deadline_within(inner.config.acquire_timeout);

        loop {
            if inner.is_closed() {
                return Err(ResilienceError::PoolClosed);
            }
            if ctx.is_cancelled() {
                return Err(ContextError::Cancelled.into());
            }

            if let Some(mut pooled) = inner.pop_idle() {
                if inner.factory.is_healthy(&pooled).await {
                    pooled.check_out();
                    return Ok(pooled);
                }
                tracing::debug!(parent: &inner.span, "discarding unhealthy idle connection");
                inner.discard(pooled).await;
                continue;
            }

            if inner.try_reserve() {
                let mut pooled = inner.create_reserved().await?;
                pooled.check_out();
                return Ok(pooled);
            }

            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A connection may have been returned between the checks above and enable()
            let has_idle = !lock(&inner.idle).is_empty();
            if has_idle
                || inner.is_closed()
                || inner.live.load(Ordering::Acquire) < inner.config.max_size
            {
                continue;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {
                    tracing::debug!(parent: &inner.span, "timed out waiting for a pooled connection");
                    return Err(ResilienceError::AcquireTimeout(inner.config.acquire_timeout));
                }
                _ = ctx.cancellation_token().cancelled() => {
                    return Err(ContextError::Cancelled.into());
                }
            }
        }
    }

    /// Return a connection to the pool
    ///
    /// Unhealthy connections, connections returned after close, and
    /// connections that do not fit in the idle queue are closed instead.
    pub async fn put(&self, mut pooled: PooledConnection<T>) -> Result<(), ResilienceError> {
        let inner = &self.inner;
        if pooled.pool_id != inner.id {
            return Err(ResilienceError::ForeignConnection);
        }

        pooled.check_in();

        if inner.is_closed() {
            inner.discard(pooled).await;
            return Ok(());
        }

        if !inner.factory.is_healthy(&pooled).await {
            tracing::debug!(parent: &inner.span, "closing unhealthy connection on return");
            inner.discard(pooled).await;
            return Ok(());
        }

        if let Some(overflow) = inner.push_idle(pooled) {
            tracing::debug!(parent: &inner.span, "idle queue full, closing surplus connection");
            inner.discard(overflow).await;
        }
        Ok(())
    }

    /// Run one health pass now
    pub async fn run_health_pass(&self) {
        self.inner.health_pass().await;
    }

    /// Register a callback run once when the pool closes
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.inner.close_callbacks).push(Box::new(callback));
    }

    /// Close the pool. Idempotent.
    ///
    /// Stops the health task, closes idle connections, runs close callbacks,
    /// and wakes every waiter so it observes the closed pool.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        inner.shutdown.cancel();
        let task = lock(&inner.health_task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(parent: &inner.span, error = %err, "pool health task ended abnormally");
            }
        }

        let idle: Vec<_> = lock(&inner.idle).drain(..).collect();
        for mut pooled in idle {
            if let Some(conn) = pooled.conn.take() {
                inner.factory.close(conn).await;
            }
            inner.live.fetch_sub(1, Ordering::AcqRel);
        }

        let callbacks = std::mem::take(&mut *lock(&inner.close_callbacks));
        for callback in callbacks {
            callback();
        }

        inner.available.notify_waiters();
        tracing::info!(parent: &inner.span, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle = lock(&self.inner.idle).len();
        let total = self.inner.live.load(Ordering::Acquire);
        PoolStats {
            total,
            idle,
            in_use: total.saturating_sub(idle),
            max_size: self.inner.config.max_size,
        }
    }
}

fn spawn_health_task<T: Send + Sync + 'static>(inner: &Arc<PoolInner<T>>) -> JoinHandle<()> {
    let weak: Weak<PoolInner<T>> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    let period = inner.config.health_check_interval;

    tokio::spawn(async move {
        // An interval too long to schedule never fires
        let Some(first_tick) = Instant::now().checked_add(period) else {
            shutdown.cancelled().await;
            return;
        };
        let mut ticker = tokio::time::interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.health_pass().await;
                }
            }
        }
    })
}

impl<T: Send + 'static> Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("live", &self.inner.live.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total live connections (idle + in use)
    pub total: usize,
    /// Number of idle connections
    pub idle: usize,
    /// Number of connections handed out
    pub in_use: usize,
    /// Maximum pool size
    pub max_size: usize,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct TestConnection {
        id: usize,
        healthy: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct TestFactory {
        created: AtomicUsize,
        closed: AtomicUsize,
        fail_after: Option<usize>,
        handles: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl TestFactory {
        fn failing_after(n: usize) -> Self {
            Self {
                fail_after: Some(n),
                ..Default::default()
            }
        }

        fn mark_all_unhealthy(&self) {
            for flag in lock(&self.handles).iter() {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<TestConnection> for TestFactory {
        async fn create(&self) -> Result<TestConnection, ResilienceError> {
            let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            if matches!(self.fail_after, Some(limit) if id > limit) {
                return Err(ResilienceError::ConnectionCreation("dial refused".to_string()));
            }
            let healthy = Arc::new(AtomicBool::new(true));
            lock(&self.handles).push(Arc::clone(&healthy));
            Ok(TestConnection { id, healthy })
        }

        async fn is_healthy(&self, conn: &TestConnection) -> bool {
            conn.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self, _conn: TestConnection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(initial: usize, max: usize) -> PoolConfig {
        PoolConfig {
            initial_size: initial,
            max_size: max,
            min_idle: 0,
            acquire_timeout: Duration::from_millis(100),
            enable_health_check: false,
            ..Default::default()
        }
    }

    async fn pool_with(factory: &Arc<TestFactory>, config: PoolConfig) -> ConnectionPool<TestConnection> {
        let factory: Arc<dyn ConnectionFactory<TestConnection>> = factory.clone();
        ConnectionPool::new(factory, config).await.unwrap()
    }

    #[test]
    fn test_config_clamping() {
        let config = PoolConfig {
            initial_size: 8,
            max_size: 0,
            min_idle: 4,
            ..Default::default()
        }
        .clamped();

        assert_eq!(config.max_size, 1);
        assert_eq!(config.initial_size, 1);
        assert_eq!(config.min_idle, 1);
    }

    #[tokio::test]
    async fn test_initial_connections_are_idle() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(&factory, config(2, 5)).await;

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.utilization(), 40.0);
    }

    #[tokio::test]
    async fn test_get_and_put_reuse() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(&factory, config(0, 5)).await;
        let ctx = CallContext::background();

        let conn = pool.get(&ctx).await.unwrap();
        assert_eq!(conn.id, 1);
        assert!(conn.is_in_use());
        assert_eq!(pool.stats().in_use, 1);

        pool.put(conn).await.unwrap();
        assert_eq!(pool.stats().idle, 1);

        let conn = pool.get(&ctx).await.unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_at_capacity() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(&factory, config(0, 2)).await;
        let ctx = CallContext::background();

        let _a = pool.get(&ctx).await.unwrap();
        let _b = pool.get(&ctx).await.unwrap();

        let start = Instant::now();
        let result = pool.get(&ctx).await;
        assert!(matches!(result, Err(ResilienceError::AcquireTimeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_receives_returned_connection() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(
            &factory,
            PoolConfig {
                acquire_timeout: Duration::from_secs(5),
                ..config(0, 1)
            },
        )
        .await;

        let held = pool.get(&CallContext::background()).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&CallContext::background()).await.map(|c| c.id) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.put(held).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_cancellation_interrupts_wait() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(
            &factory,
            PoolConfig {
                acquire_timeout: Duration::from_secs(30),
                ..config(0, 1)
            },
        )
        .await;
        let _held = pool.get(&CallContext::background()).await.unwrap();

        let ctx = CallContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = pool.get(&ctx).await;
        assert_eq!(
            result.unwrap_err(),
            ResilienceError::Context(ContextError::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_caps_acquire_timeout() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(
            &factory,
            PoolConfig {
                acquire_timeout: Duration::from_secs(30),
                ..config(0, 1)
            },
        )
        .await;
        let _held = pool.get(&CallContext::background()).await.unwrap();

        let ctx = CallContext::background().with_timeout(Duration::from_millis(40));
        let start = Instant::now();
        assert!(matches!(pool.get(&ctx).await, Err(ResilienceError::AcquireTimeout(_))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unhealthy_idle_connection_is_replaced() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(&factory, config(2, 2)).await;

        factory.mark_all_unhealthy();

        let conn = pool.get(&CallContext::background()).await.unwrap();
        assert_eq!(conn.id, 3);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
        assert!(pool.stats().total <= 2);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_closed_on_put() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(&factory, config(0, 3)).await;

        let conn = pool.get(&CallContext::background()).await.unwrap();
        conn.healthy.store(false, Ordering::SeqCst);
        pool.put(conn).await.unwrap();

        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_put_rejects_foreign_connection() {
        let factory = Arc::new(TestFactory::default());
        let first = pool_with(&factory, config(0, 2)).await;
        let second = pool_with(&factory, config(0, 2)).await;

        let conn = first.get(&CallContext::background()).await.unwrap();
        assert_eq!(second.put(conn).await, Err(ResilienceError::ForeignConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_pass_evicts_stale_and_tops_up() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(
            &factory,
            PoolConfig {
                min_idle: 2,
                max_idle: Duration::from_secs(1),
                ..config(3, 4)
            },
        )
        .await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        pool.run_health_pass().await;

        let stats = pool.stats();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_task_runs_on_interval() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(
            &factory,
            PoolConfig {
                enable_health_check: true,
                health_check_interval: Duration::from_secs(10),
                ..config(2, 4)
            },
        )
        .await;

        factory.mark_all_unhealthy();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_initial_creation_failure_closes_partial_pool() {
        let factory = Arc::new(TestFactory::failing_after(2));
        let dyn_factory: Arc<dyn ConnectionFactory<TestConnection>> = factory.clone();

        let result = ConnectionPool::new(dyn_factory, config(3, 5)).await;

        assert!(matches!(result, Err(ResilienceError::ConnectionCreation(_))));
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_creation_failure_refunds_slot() {
        let factory = Arc::new(TestFactory::failing_after(0));
        let pool = pool_with(&factory, config(0, 1)).await;

        assert!(pool.get(&CallContext::background()).await.is_err());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(&factory, config(2, 4)).await;
        let held = pool.get(&CallContext::background()).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        pool.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pool.close().await;
        pool.close().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pool.get(&CallContext::background()).await,
            Err(ResilienceError::PoolClosed)
        ));

        pool.put(held).await.unwrap();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_frees_slot() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(&factory, config(0, 1)).await;
        let ctx = CallContext::background();

        // The holder is abandoned before it can hand the connection back
        let holder = async {
            let conn = pool.get(&ctx).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            pool.put(conn).await
        };
        assert!(tokio::time::timeout(Duration::from_millis(10), holder).await.is_err());

        let conn = pool.get(&ctx).await.unwrap();
        assert_eq!(conn.id, 2);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 1);

        pool.put(conn).await.unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_foreign_connection_goes_home_on_drop() {
        let factory = Arc::new(TestFactory::default());
        let first = pool_with(&factory, config(0, 2)).await;
        let second = pool_with(&factory, config(0, 2)).await;

        let conn = first.get(&CallContext::background()).await.unwrap();
        assert_eq!(first.stats().in_use, 1);
        assert!(second.put(conn).await.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.stats().total, 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unschedulable_health_interval() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(
            &factory,
            PoolConfig {
                enable_health_check: true,
                health_check_interval: Duration::MAX,
                acquire_timeout: Duration::MAX,
                ..config(1, 2)
            },
        )
        .await;

        let conn = pool.get(&CallContext::background()).await.unwrap();
        pool.put(conn).await.unwrap();
        pool.close().await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_count_never_exceeds_max() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(
            &factory,
            PoolConfig {
                acquire_timeout: Duration::from_secs(5),
                ..config(0, 3)
            },
        )
        .await;

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let conn = pool.get(&CallContext::background()).await.unwrap();
                    assert!(pool.stats().total <= 3);
                    tokio::task::yield_now().await;
                    pool.put(conn).await.unwrap();
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(factory.created.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().in_use, 0);
    }
}
