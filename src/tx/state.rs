//! Transaction state tracked by the coordinator.

use std::fmt;

use crate::service::TxHandle;

/// Lifecycle state of one logical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    /// No transaction has been started yet.
    #[default]
    None,
    /// Statements are being accepted.
    Active,
    /// The commit request is in flight.
    CommitPending,
    Committed,
    RolledBack,
}

impl TxState {
    /// Returns true for `Committed` and `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Active => "ACTIVE",
            Self::CommitPending => "COMMIT_PENDING",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state of the transaction attached to one connection.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    state: TxState,
    handle: Option<TxHandle>,
    statements: u64,
    first_statement: bool,
}

impl Transaction {
    /// A transaction that has not started.
    pub fn new() -> Self {
        Self {
            first_statement: true,
            ..Self::default()
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Remote transaction id, once assigned.
    pub fn id(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.id.as_str())
    }

    pub fn handle(&self) -> Option<&TxHandle> {
        self.handle.as_ref()
    }

    /// Number of statements that completed successfully.
    pub fn statement_count(&self) -> u64 {
        self.statements
    }

    /// True until the first statement completes successfully.
    pub fn is_first_statement(&self) -> bool {
        self.first_statement
    }

    /// Binds a freshly begun remote transaction. Keeps the first-statement flag.
    pub(crate) fn activate(&mut self, handle: TxHandle) {
        self.handle = Some(handle);
        self.state = TxState::Active;
    }

    /// Drops the remote handle after a failed attempt, ready for a retry.
    pub(crate) fn detach(&mut self) -> Option<TxHandle> {
        self.state = TxState::None;
        self.handle.take()
    }

    pub(crate) fn record_statement(&mut self) {
        self.statements += 1;
        self.first_statement = false;
    }

    pub(crate) fn mark_commit_pending(&mut self) {
        self.state = TxState::CommitPending;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TxState::Committed;
    }

    pub(crate) fn mark_rolled_back(&mut self) {
        self.state = TxState::RolledBack;
    }
}
