//! Entry point for opening connections.

use std::sync::Arc;

use tracing::info;

use super::Connection;
use crate::config::ConnectionConfig;
use crate::context::ContextCache;
use crate::error::Result;
use crate::service::ServiceFactory;

/// Opens [`Connection`]s that share contexts through one [`ContextCache`].
#[derive(Clone, Default)]
pub struct Driver {
    cache: Arc<ContextCache>,
}

impl Driver {
    /// Creates a driver connecting through the built-in backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a driver using a custom service factory.
    pub fn with_factory(factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            cache: Arc::new(ContextCache::new(factory)),
        }
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    /// Opens a connection for `config`.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Connection> {
        let context = self.cache.acquire(config).await?;
        Ok(Connection::new(
            Arc::clone(&self.cache),
            config.clone(),
            context,
        ))
    }

    /// Opens a connection from a connection string.
    pub async fn connect_url(&self, url: &str) -> Result<Connection> {
        let config = ConnectionConfig::from_connection_string(url)?;
        self.connect(&config).await
    }

    /// Closes every shared context. Open connections fail afterwards.
    pub async fn shutdown(&self) -> usize {
        let closed = self.cache.close_all().await;
        info!("Driver shut down, {} contexts closed", closed);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxGuardError;
    use crate::tx::TxState;

    #[tokio::test]
    async fn test_connections_share_context() {
        let driver = Driver::new();
        let a = driver.connect_url("memory://shared").await.unwrap();
        let b = driver.connect_url("memory://shared").await.unwrap();

        assert!(Arc::ptr_eq(a.context(), b.context()));
        assert_eq!(a.context().ref_count(), 2);

        a.close().await.unwrap();
        assert_eq!(driver.cache().len(), 1);
        assert_eq!(b.context().ref_count(), 1);
        b.close().await.unwrap();
        assert!(driver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_close_rolls_back_open_transaction() {
        let driver = Driver::new();
        let mut conn = driver
            .connect_url("memory://rollback?auto_commit=false")
            .await
            .unwrap();

        conn.execute_sql("UPDATE t SET a = 1", &crate::query::ParamSet::new())
            .await
            .unwrap();
        assert_eq!(conn.state(), TxState::Active);

        let context = Arc::clone(conn.context());
        conn.close().await.unwrap();
        assert!(context.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_invalidates_connections() {
        let driver = Driver::new();
        let conn = driver.connect_url("memory://gone").await.unwrap();

        assert_eq!(driver.shutdown().await, 1);
        let err = conn.prepare("SELECT 1").unwrap_err();
        assert!(matches!(err, TxGuardError::Connection(_)));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_connection_releases_context() {
        let driver = Driver::new();
        let config = ConnectionConfig::memory("dropped");
        let kept = driver.connect(&config).await.unwrap();
        let dropped = driver.connect(&config).await.unwrap();
        let context = Arc::clone(kept.context());

        drop(dropped);
        assert_eq!(context.ref_count(), 1);
        assert!(driver.cache().contains(&config));

        drop(kept);
        assert_eq!(context.ref_count(), 0);
        assert!(!driver.cache().contains(&config));

        for _ in 0..10 {
            if context.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(context.is_closed());
    }
}
