//! Logical connection handle.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::context::{Context, ContextCache};
use crate::error::{Result, TxGuardError};
use crate::query::{ParamBinder, ParamSet};
use crate::service::{QueryResult, QueryService};
use crate::tx::{CommitOutcome, Transaction, TransactionCoordinator, TxState};

/// One logical, sequential connection.
///
/// Holds a reference to a shared [`Context`] and its own
/// [`TransactionCoordinator`]. Call [`close`](Self::close) to give the
/// reference back. Dropping the handle releases it as well; the remote
/// rollback and context close then run on a spawned task.
pub struct Connection {
    cache: Arc<ContextCache>,
    config: ConnectionConfig,
    context: Arc<Context>,
    coordinator: TransactionCoordinator,
    released: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config.display_string())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        cache: Arc<ContextCache>,
        config: ConnectionConfig,
        context: Arc<Context>,
    ) -> Self {
        let coordinator = context.coordinator();
        Self {
            cache,
            config,
            context,
            coordinator,
            released: false,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Parses `sql` (through the context's query cache) and returns a binder for it.
    pub fn prepare(&self, sql: &str) -> Result<ParamBinder> {
        self.ensure_open()?;
        Ok(ParamBinder::new(self.context.prepare(sql)?))
    }

    /// Executes the binder's query with its current bindings.
    pub async fn execute(&mut self, binder: &ParamBinder) -> Result<QueryResult> {
        self.ensure_open()?;
        let params = binder.build()?;
        self.coordinator.execute(binder.query(), &params).await
    }

    /// Executes `sql` with already-bound parameters.
    pub async fn execute_sql(&mut self, sql: &str, params: &ParamSet) -> Result<QueryResult> {
        self.ensure_open()?;
        let query = self.context.prepare(sql)?;
        self.coordinator.execute(&query, params).await
    }

    /// Executes every parameter set accumulated in the binder's batch.
    ///
    /// The batch is taken from the binder whether or not execution succeeds.
    pub async fn execute_batch(&mut self, binder: &mut ParamBinder) -> Result<Vec<QueryResult>> {
        self.ensure_open()?;
        let batch = binder.take_batch();
        let query = Arc::clone(binder.query());
        self.coordinator.execute_batch(&query, &batch).await
    }

    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        self.ensure_open()?;
        self.coordinator.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.coordinator.rollback().await
    }

    pub fn auto_commit(&self) -> bool {
        self.coordinator.auto_commit()
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.coordinator.set_auto_commit(auto_commit)
    }

    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.coordinator.set_read_only(read_only)
    }

    /// State of the current transaction.
    pub fn state(&self) -> TxState {
        self.coordinator.state()
    }

    pub fn transaction(&self) -> &Transaction {
        self.coordinator.transaction()
    }

    /// Rolls back any open transaction and releases the context.
    pub async fn close(mut self) -> Result<()> {
        if !self.context.is_closed() {
            self.coordinator.rollback().await?;
        }
        debug!("Closing connection to {}", self.config.display_string());
        self.released = true;
        self.cache.release(&self.config, &self.context).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.context.is_closed() {
            return Err(TxGuardError::connection(format!(
                "connection to {} has been shut down",
                self.config.display_string()
            )));
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let owns_close = match self.cache.detach(&self.config, &self.context) {
            Ok(owns_close) => owns_close,
            Err(e) => {
                warn!("Releasing dropped connection failed: {}", e);
                return;
            }
        };
        let open_tx = match self.coordinator.state() {
            TxState::Active | TxState::CommitPending => {
                self.coordinator.transaction().handle().cloned()
            }
            _ => None,
        };
        if open_tx.is_none() && !owns_close {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(
                "Connection to {} dropped outside a runtime; remote cleanup skipped",
                self.config.display_string()
            );
            return;
        };
        debug!(
            "Connection to {} dropped without close",
            self.config.display_string()
        );
        let context = Arc::clone(&self.context);
        runtime.spawn(async move {
            if let Some(tx) = open_tx {
                if let Err(status) = context.service().rollback(&tx).await {
                    debug!(
                        "Ignoring rollback failure for transaction {}: {}",
                        tx.id, status
                    );
                }
            }
            if owns_close {
                if let Err(e) = context.close().await {
                    warn!("Closing context after drop failed: {}", e);
                }
            }
        });
    }
}
