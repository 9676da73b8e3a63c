//! Shared per-configuration context.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{Result, TxGuardError};
use crate::query::Query;
use crate::service::QueryService;
use crate::tx::{TransactionCoordinator, TxValidator};

/// Resources shared by every connection opened with an equal configuration:
/// the query service (and its session pool), the marker-table validator and
/// the prepared-query cache.
///
/// Contexts are reference counted by [`ContextCache`](super::ContextCache);
/// the count tracks external handles, not `Arc` clones.
pub struct Context {
    config: ConnectionConfig,
    service: Arc<dyn QueryService>,
    validator: Option<TxValidator>,
    queries: DashMap<String, Arc<Query>>,
    refs: AtomicUsize,
    closed: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config.display_string())
            .field("validator", &self.validator)
            .field("cached_queries", &self.queries.len())
            .field("refs", &self.ref_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Context {
    /// Initializes a context on top of a connected service.
    ///
    /// Ensures the validation table when one is configured. On failure the
    /// service is closed before the error is returned.
    pub async fn open(config: ConnectionConfig, service: Arc<dyn QueryService>) -> Result<Self> {
        let validator = match config.tx_validation_table.as_deref() {
            Some(table) => {
                let ensured = match TxValidator::new(
                    Arc::clone(&service),
                    table,
                    config.operation_timeout(),
                ) {
                    Ok(validator) => {
                        let ensured = validator.ensure().await;
                        ensured.map(|()| validator)
                    }
                    Err(e) => Err(e),
                };
                match ensured {
                    Ok(validator) => Some(validator),
                    Err(e) => {
                        if let Err(status) = service.close().await {
                            debug!("Ignoring close failure after init error: {}", status);
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        debug!("Opened context for {}", config.display_string());
        Ok(Self {
            config,
            service,
            validator,
            queries: DashMap::new(),
            refs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<dyn QueryService> {
        &self.service
    }

    pub fn validator(&self) -> Option<&TxValidator> {
        self.validator.as_ref()
    }

    /// Returns the parsed query for `sql`, parsing it on first use.
    ///
    /// Once the cache holds `query_cache_size` entries, new queries are
    /// parsed but not cached.
    pub fn prepare(&self, sql: &str) -> Result<Arc<Query>> {
        if let Some(query) = self.queries.get(sql) {
            return Ok(Arc::clone(query.value()));
        }

        let query = Arc::new(Query::parse(sql)?);
        if self.queries.len() >= self.config.query_cache_size {
            return Ok(query);
        }
        let entry = self.queries.entry(sql.to_string()).or_insert(query);
        Ok(Arc::clone(entry.value()))
    }

    /// Number of cached prepared queries.
    pub fn cached_queries(&self) -> usize {
        self.queries.len()
    }

    /// Creates a coordinator for a new connection using this context.
    pub fn coordinator(&self) -> TransactionCoordinator {
        let coordinator =
            TransactionCoordinator::new(Arc::clone(&self.service), self.config.operation_timeout())
                .with_auto_commit(self.config.auto_commit);
        match &self.validator {
            Some(validator) => coordinator.with_validator(validator.clone()),
            None => coordinator,
        }
    }

    /// Number of outstanding external references.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference and returns the remaining count.
    pub(crate) fn release_ref(&self) -> Result<usize> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| {
                TxGuardError::invalid_state("context released more times than it was acquired")
            })
    }

    /// Closes the service. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.queries.clear();
        debug!("Closing context for {}", self.config.display_string());

        let closed =
            tokio::time::timeout(self.config.operation_timeout(), self.service.close()).await;
        match closed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(status)) => {
                warn!(
                    "Closing service for {} failed: {}",
                    self.config.display_string(),
                    status
                );
                Err(TxGuardError::fatal_with_status(status.code, status.message))
            }
            Err(_) => Err(TxGuardError::timeout(
                None,
                format!(
                    "closing service for {} timed out",
                    self.config.display_string()
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{CallKind, MockQueryService, StatusCode};

    #[tokio::test]
    async fn test_open_ensures_validation_table() {
        let mock = Arc::new(MockQueryService::new());
        let config = ConnectionConfig::memory("ctx").with_validation_table("markers");

        let ctx = Context::open(config, mock.clone()).await.unwrap();
        assert!(mock.has_table("markers"));
        assert_eq!(ctx.validator().map(|v| v.table()), Some("markers"));
    }

    #[tokio::test]
    async fn test_open_failure_names_table_and_closes_service() {
        let mock = Arc::new(MockQueryService::new());
        mock.fail_next(CallKind::EnsureTable, StatusCode::SchemeError);
        let config = ConnectionConfig::memory("ctx").with_validation_table("ops.markers");

        let err = Context::open(config, mock.clone()).await.unwrap_err();
        assert!(matches!(err, TxGuardError::Config(_)));
        assert!(err.to_string().contains("ops.markers"));
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected_locally() {
        let mock = Arc::new(MockQueryService::new());
        let config = ConnectionConfig::memory("ctx").with_validation_table("bad name");

        let err = Context::open(config, mock.clone()).await.unwrap_err();
        assert!(matches!(err, TxGuardError::Config(_)));
        assert_eq!(mock.call_count(CallKind::EnsureTable), 0);
    }

    #[tokio::test]
    async fn test_prepare_caches_up_to_limit() {
        let mut config = ConnectionConfig::memory("ctx");
        config.query_cache_size = 1;
        let ctx = Context::open(config, Arc::new(MockQueryService::new()))
            .await
            .unwrap();

        let a1 = ctx.prepare("SELECT 1").unwrap();
        let a2 = ctx.prepare("SELECT 1").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));

        let b1 = ctx.prepare("SELECT 2").unwrap();
        let b2 = ctx.prepare("SELECT 2").unwrap();
        assert!(!Arc::ptr_eq(&b1, &b2));
        assert_eq!(ctx.cached_queries(), 1);
    }

    #[tokio::test]
    async fn test_refcount_and_idempotent_close() {
        let mock = Arc::new(MockQueryService::new());
        let ctx = Context::open(ConnectionConfig::memory("ctx"), mock.clone())
            .await
            .unwrap();

        assert_eq!(ctx.retain(), 1);
        assert_eq!(ctx.release_ref().unwrap(), 0);
        assert!(ctx.release_ref().is_err());

        ctx.close().await.unwrap();
        ctx.close().await.unwrap();
        assert!(ctx.is_closed());
        assert!(mock.is_closed());
    }
}
