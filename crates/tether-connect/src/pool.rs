//! Transport-backed connection pooling
//!
//! Adapts a [`Transport`] to the generic [`ConnectionPool`]: pooled connections
//! are shared transport handles, and a handle is healthy while its state is
//! neither `TransientFailure` nor `Shutdown`.

use crate::error::ConnectError;
use crate::manager::{close_quietly, establish};
use crate::transport::{Transport, TransportHandle};
use std::sync::Arc;
use std::time::Duration;
use tether_core_resilience::{CallContext, ConnectionFactory, ConnectionPool, PoolConfig, ResilienceError};
use tracing::Span;

/// Pool of handles produced by transport `T`
pub type TransportPool<T> = ConnectionPool<Arc<<T as Transport>::Handle>>;

/// Creates ready transport handles for one target
pub struct TransportConnectionFactory<T: Transport> {
    transport: Arc<T>,
    target: String,
    connect_timeout: Duration,
    span: Span,
}

impl<T: Transport> TransportConnectionFactory<T> {
    pub fn new(
        transport: Arc<T>,
        target: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let target = target.into();
        if target.is_empty() {
            return Err(ConnectError::EmptyTarget);
        }

        Ok(Self {
            transport,
            target,
            connect_timeout,
            span: Span::none(),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait::async_trait]
impl<T: Transport> ConnectionFactory<Arc<T::Handle>> for TransportConnectionFactory<T> {
    async fn create(&self) -> Result<Arc<T::Handle>, ResilienceError> {
        establish(
            &*self.transport,
            &self.target,
            &CallContext::background(),
            self.connect_timeout,
            &self.span,
        )
        .await
        .map(Arc::new)
        .map_err(|err| ResilienceError::ConnectionCreation(err.to_string()))
    }

    async fn is_healthy(&self, conn: &Arc<T::Handle>) -> bool {
        !conn.state().is_failed()
    }

    async fn close(&self, conn: Arc<T::Handle>) {
        close_quietly(&*conn, &self.span).await;
    }
}

/// Build a pool of ready handles to `target`
pub async fn connect_pool<T: Transport>(
    transport: Arc<T>,
    target: &str,
    connect_timeout: Duration,
    config: PoolConfig,
    span: Span,
) -> Result<TransportPool<T>, ConnectError> {
    let factory = TransportConnectionFactory::new(transport, target, connect_timeout)?.with_span(span.clone());
    let factory: Arc<dyn ConnectionFactory<Arc<T::Handle>>> = Arc::new(factory);
    Ok(ConnectionPool::with_span(factory, config, span).await?)
}
