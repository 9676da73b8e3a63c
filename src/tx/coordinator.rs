//! Transaction coordinator.
//!
//! Drives one logical connection's transaction through its state machine,
//! applies the retry policy from [`classify`] and resolves ambiguous commits
//! through the [`TxValidator`]. A coordinator is a sequential object: every
//! operation takes `&mut self`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::classifier::{classify, Disposition, Phase};
use super::state::{Transaction, TxState};
use super::validator::{Resolution, TxValidator, ValidationRecord};
use crate::error::{Result, TxGuardError};
use crate::query::{ParamSet, Query, QueryKind};
use crate::service::{
    QueryResult, QueryService, ServiceResult, Status, StatusCode, TxHandle, TxMode,
};

/// How a successful commit was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The service acknowledged the commit.
    Committed,
    /// The acknowledgement was lost; the marker row proved the commit applied.
    ConfirmedByMarker,
}

/// Coordinates statements, commits and rollbacks for one connection.
pub struct TransactionCoordinator {
    service: Arc<dyn QueryService>,
    validator: Option<TxValidator>,
    tx: Transaction,
    auto_commit: bool,
    read_only: bool,
    timeout: Duration,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("tx", &self.tx)
            .field("validator", &self.validator)
            .field("auto_commit", &self.auto_commit)
            .field("read_only", &self.read_only)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TransactionCoordinator {
    /// Creates a coordinator in explicit-transaction mode.
    pub fn new(service: Arc<dyn QueryService>, timeout: Duration) -> Self {
        Self {
            service,
            validator: None,
            tx: Transaction::new(),
            auto_commit: false,
            read_only: false,
            timeout,
        }
    }

    /// Enables ambiguous-commit resolution through `validator`.
    pub fn with_validator(mut self, validator: TxValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Current transaction state.
    pub fn state(&self) -> TxState {
        self.tx.state()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Switches auto-commit mode. Refused while a transaction is open.
    pub fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.ensure_idle("change auto-commit mode")?;
        self.auto_commit = auto_commit;
        Ok(())
    }

    /// Switches read-only mode. Refused while a transaction is open.
    ///
    /// Read-only transactions write no marker row.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.ensure_idle("change read-only mode")?;
        self.read_only = read_only;
        Ok(())
    }

    fn ensure_idle(&self, action: &str) -> Result<()> {
        match self.tx.state() {
            TxState::Active | TxState::CommitPending => Err(TxGuardError::invalid_state(format!(
                "cannot {} while transaction is {}",
                action,
                self.tx.state()
            ))),
            _ => Ok(()),
        }
    }

    /// Executes one statement.
    ///
    /// Under auto-commit, data statements run in their own transaction which
    /// is committed before returning.
    pub async fn execute(&mut self, query: &Query, params: &ParamSet) -> Result<QueryResult> {
        self.prepare_for_statement(query)?;

        if !query.kind().is_transactional() {
            return self.execute_standalone(query, params).await;
        }

        if self.auto_commit {
            let result = self.run_in_tx(query, params).await;
            return self.finish_one_shot(result).await;
        }

        self.run_in_tx(query, params).await
    }

    /// Executes `query` once per parameter set, in order.
    ///
    /// Under auto-commit the whole batch runs in one transaction.
    pub async fn execute_batch(
        &mut self,
        query: &Query,
        batch: &[ParamSet],
    ) -> Result<Vec<QueryResult>> {
        self.prepare_for_statement(query)?;

        if !query.kind().is_transactional() {
            let mut results = Vec::with_capacity(batch.len());
            for params in batch {
                results.push(self.execute_standalone(query, params).await?);
            }
            return Ok(results);
        }

        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(batch.len());
        for params in batch {
            match self.run_in_tx(query, params).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    return if self.auto_commit {
                        self.finish_one_shot(Err(e)).await
                    } else {
                        Err(e)
                    }
                }
            }
        }

        if self.auto_commit {
            self.commit().await?;
        }
        Ok(results)
    }

    /// Commits the active transaction.
    ///
    /// Never re-sends a commit: calling this on a finished transaction is a
    /// [`TxGuardError::TransactionInvalid`].
    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        if self.tx.state() != TxState::Active {
            return Err(TxGuardError::invalid_state(format!(
                "cannot commit transaction in state {}",
                self.tx.state()
            )));
        }
        let Some(handle) = self.tx.handle().cloned() else {
            return Err(TxGuardError::invalid_state(
                "active transaction has no remote handle",
            ));
        };

        if let Some(validator) = self.marker_validator() {
            let record = ValidationRecord::new(handle.id.clone());
            let statement = validator.marker_statement();
            let written = self
                .with_deadline(
                    self.service
                        .send(&statement, &record.to_params(), Some(&handle)),
                )
                .await;
            if let Err(status) = written {
                warn!(
                    "Writing commit marker for transaction {} failed: {}",
                    handle.id, status
                );
                let disposition = classify(status.code, Phase::Execute, false);
                self.best_effort_rollback(&handle).await;
                self.tx.mark_rolled_back();
                return Err(surface(status, disposition));
            }
        }

        self.tx.mark_commit_pending();
        debug!("Committing transaction {}", handle.id);
        let committed = self.with_deadline(self.service.commit(&handle)).await;

        let status = match committed {
            Ok(()) => {
                self.tx.mark_committed();
                return Ok(CommitOutcome::Committed);
            }
            Err(status) => status,
        };

        match classify(status.code, Phase::Commit, false) {
            Disposition::ConditionallyRetryable => self.resolve_ambiguous(&handle, status).await,
            disposition => {
                warn!("Commit of transaction {} failed: {}", handle.id, status);
                self.best_effort_rollback(&handle).await;
                self.tx.mark_rolled_back();
                Err(surface(status, disposition))
            }
        }
    }

    /// Rolls back the open transaction.
    ///
    /// The remote rollback is best-effort; local state always ends up
    /// `RolledBack`. A no-op when no transaction is open.
    pub async fn rollback(&mut self) -> Result<()> {
        match self.tx.state() {
            TxState::Active | TxState::CommitPending => {
                if let Some(handle) = self.tx.handle().cloned() {
                    self.best_effort_rollback(&handle).await;
                }
                self.tx.mark_rolled_back();
            }
            TxState::None | TxState::Committed | TxState::RolledBack => {}
        }
        Ok(())
    }

    /// Checks the state before a statement and starts a fresh transaction
    /// after a finished one.
    fn prepare_for_statement(&mut self, query: &Query) -> Result<()> {
        match self.tx.state() {
            TxState::CommitPending => {
                return Err(TxGuardError::invalid_state(
                    "commit is pending; roll back before issuing new statements",
                ))
            }
            TxState::Committed | TxState::RolledBack => self.tx = Transaction::new(),
            TxState::None | TxState::Active => {}
        }

        if query.kind() == QueryKind::Scheme && self.tx.state() == TxState::Active {
            return Err(TxGuardError::invalid_state(
                "scheme queries cannot run inside a transaction",
            ));
        }
        Ok(())
    }

    /// Runs a statement outside any transaction, retrying once when safe.
    async fn execute_standalone(&mut self, query: &Query, params: &ParamSet) -> Result<QueryResult> {
        let mut retried = false;
        loop {
            let sent = self
                .with_deadline(self.service.send(query.normalized(), params, None))
                .await;
            let status = match sent {
                Ok(result) => return Ok(result),
                Err(status) => status,
            };

            match classify(status.code, Phase::Execute, true) {
                Disposition::RetryableFresh | Disposition::RetryableNewTx if !retried => {
                    info!(
                        "{} statement failed with {}, retrying once",
                        query.kind(),
                        status.code
                    );
                    retried = true;
                }
                Disposition::RetryableFresh | Disposition::RetryableNewTx => {
                    return Err(exhausted(status))
                }
                disposition => return Err(surface(status, disposition)),
            }
        }
    }

    /// Runs a statement inside the current transaction, beginning one if needed.
    async fn run_in_tx(&mut self, query: &Query, params: &ParamSet) -> Result<QueryResult> {
        let mut retried = false;
        loop {
            let handle = match self.tx.handle().cloned() {
                Some(handle) if self.tx.state() == TxState::Active => handle,
                _ => match self.begin().await {
                    Ok(handle) => handle,
                    Err(status) => {
                        let disposition = classify(status.code, Phase::Execute, true);
                        match disposition {
                            Disposition::RetryableFresh | Disposition::RetryableNewTx
                                if !retried =>
                            {
                                info!("Begin failed with {}, retrying once", status.code);
                                retried = true;
                                continue;
                            }
                            Disposition::RetryableFresh | Disposition::RetryableNewTx => {
                                return Err(exhausted(status))
                            }
                            Disposition::Timeout => {
                                self.tx.mark_rolled_back();
                                return Err(surface(status, disposition));
                            }
                            _ => return Err(surface(status, disposition)),
                        }
                    }
                },
            };

            let sent = self
                .with_deadline(self.service.send(query.normalized(), params, Some(&handle)))
                .await;
            let status = match sent {
                Ok(result) => {
                    self.tx.record_statement();
                    return Ok(result);
                }
                Err(status) => status,
            };

            let first = self.tx.is_first_statement();
            let disposition = classify(status.code, Phase::Execute, first);
            match disposition {
                Disposition::RetryableFresh | Disposition::RetryableNewTx if first && !retried => {
                    info!(
                        "First statement of transaction {} failed with {} ({}), retrying once",
                        handle.id, status.code, disposition
                    );
                    self.abandon().await;
                    retried = true;
                }
                Disposition::RetryableFresh | Disposition::RetryableNewTx if first => {
                    self.abandon().await;
                    self.tx.mark_rolled_back();
                    return Err(exhausted(status));
                }
                Disposition::RetryableNewTx => {
                    // Earlier statements of this transaction are gone; replaying
                    // only the last one would commit a partial transaction.
                    warn!(
                        "Transaction {} was aborted after {} statements",
                        handle.id,
                        self.tx.statement_count()
                    );
                    self.abandon().await;
                    self.tx.mark_rolled_back();
                    return Err(TxGuardError::fatal_with_status(
                        status.code,
                        format!("transaction aborted, roll back and retry: {}", status.message),
                    ));
                }
                Disposition::Timeout => {
                    self.abandon().await;
                    self.tx.mark_rolled_back();
                    return Err(surface(status, disposition));
                }
                Disposition::Fatal if status.code.is_session_related() => {
                    return Err(TxGuardError::fatal_with_status(
                        status.code,
                        format!("transaction already active: {}", status.message),
                    ));
                }
                _ => return Err(surface(status, disposition)),
            }
        }
    }

    /// Commits a one-shot auto-commit transaction, or rolls it back on error.
    async fn finish_one_shot<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                self.rollback().await?;
                Err(e)
            }
        }
    }

    async fn begin(&mut self) -> ServiceResult<TxHandle> {
        let mode = if self.read_only {
            TxMode::ReadOnly
        } else {
            TxMode::SerializableReadWrite
        };
        let handle = self
            .with_deadline(self.service.begin_transaction(mode))
            .await?;
        debug!(
            "Began transaction {} on session {}",
            handle.id, handle.session_id
        );
        self.tx.activate(handle.clone());
        Ok(handle)
    }

    /// Drops the current remote transaction so the next attempt begins a new one.
    async fn abandon(&mut self) {
        if let Some(handle) = self.tx.detach() {
            self.best_effort_rollback(&handle).await;
        }
    }

    async fn best_effort_rollback(&self, handle: &TxHandle) {
        if let Err(status) = self.with_deadline(self.service.rollback(handle)).await {
            debug!(
                "Ignoring rollback failure for transaction {}: {}",
                handle.id, status
            );
        }
    }

    /// Validator to use for marker rows, if the transaction writes.
    fn marker_validator(&self) -> Option<&TxValidator> {
        if self.read_only {
            None
        } else {
            self.validator.as_ref()
        }
    }

    async fn resolve_ambiguous(
        &mut self,
        handle: &TxHandle,
        status: Status,
    ) -> Result<CommitOutcome> {
        warn!(
            "Commit of transaction {} is ambiguous: {}",
            handle.id, status
        );

        if self.read_only {
            // Nothing was written, so either outcome is equivalent.
            self.tx.mark_committed();
            return Ok(CommitOutcome::Committed);
        }

        let Some(validator) = self.validator.as_ref() else {
            self.tx.mark_rolled_back();
            return Err(TxGuardError::AmbiguousCommitUnresolved {
                status: status.code,
                message: format!(
                    "{}; no transaction validation table is configured",
                    status.message
                ),
            });
        };

        match validator.resolve(&handle.id, status.code).await {
            Resolution::Committed => {
                info!(
                    "Transaction {} confirmed committed by marker row",
                    handle.id
                );
                self.tx.mark_committed();
                Ok(CommitOutcome::ConfirmedByMarker)
            }
            Resolution::NotCommitted => {
                self.best_effort_rollback(handle).await;
                self.tx.mark_rolled_back();
                Err(TxGuardError::NotCommitted {
                    status: status.code,
                    tx_id: handle.id.clone(),
                })
            }
            Resolution::Unresolved(reason) => {
                self.tx.mark_rolled_back();
                Err(TxGuardError::AmbiguousCommitUnresolved {
                    status: status.code,
                    message: format!("{}; {}", status.message, reason),
                })
            }
        }
    }

    /// Applies the operation deadline to one remote call.
    async fn with_deadline<T, F>(&self, call: F) -> ServiceResult<T>
    where
        F: Future<Output = ServiceResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Status::new(
                StatusCode::ClientDeadlineExceeded,
                format!("no response within {:?}", self.timeout),
            )),
        }
    }
}

/// Converts a non-retried failure into the surfaced error.
fn surface(status: Status, disposition: Disposition) -> TxGuardError {
    match disposition {
        Disposition::Timeout => TxGuardError::timeout(Some(status.code), status.message),
        _ => TxGuardError::fatal_with_status(status.code, status.message),
    }
}

fn exhausted(status: Status) -> TxGuardError {
    TxGuardError::RetryExhausted {
        status: status.code,
        message: status.message,
    }
}
