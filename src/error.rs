//! Error types for txguard.
//!
//! Defines the main error enum used throughout the crate. Every variant that
//! originates from a remote call carries the remote status code so callers
//! can layer their own retry policy on top.

use thiserror::Error;

use crate::service::StatusCode;

/// Local parameter-binding failures. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    /// Positional index outside `[1, count]`.
    #[error("Parameter index {index} is out of range (query declares {count} parameters)")]
    OutOfRange { index: usize, count: usize },

    /// Name not declared by the query.
    #[error("Parameter '{0}' is not declared by the query")]
    NotFound(String),

    /// Typed value whose type differs from the declared one.
    #[error("Parameter '{name}' expects {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// NULL or unbound value for a non-nullable parameter.
    #[error("Missing required value for parameter '{0}'")]
    MissingRequiredValue(String),
}

/// Main error type for txguard operations.
#[derive(Error, Debug)]
pub enum TxGuardError {
    /// Parameter binding errors (bad index, unknown name, type mismatch, missing value).
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    /// A transparent retry failed a second time.
    #[error("Retry exhausted ({status}): {message}")]
    RetryExhausted { status: StatusCode, message: String },

    /// Operation attempted on a transaction in a terminal or inappropriate state.
    #[error("Invalid transaction state: {0}")]
    TransactionInvalid(String),

    /// The commit outcome was ambiguous and the confirming lookup itself failed.
    #[error("Commit outcome unknown ({status}): {message}")]
    AmbiguousCommitUnresolved { status: StatusCode, message: String },

    /// The ambiguous commit was verified as not applied.
    #[error(
        "Transaction {tx_id} was not committed ({status}); start a new transaction to retry"
    )]
    NotCommitted { status: StatusCode, tx_id: String },

    /// Deadline exceeded or request cancelled.
    #[error("Timeout: {message}")]
    Timeout {
        status: Option<StatusCode>,
        message: String,
    },

    /// Anything not covered above.
    #[error("Fatal error: {message}")]
    Fatal {
        status: Option<StatusCode>,
        message: String,
    },

    /// Configuration errors (invalid config file, unusable validation table, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection establishment errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),
}

impl TxGuardError {
    /// Creates a fatal error without a remote status.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            status: None,
            message: msg.into(),
        }
    }

    /// Creates a fatal error carrying the remote status.
    pub fn fatal_with_status(status: StatusCode, msg: impl Into<String>) -> Self {
        Self::Fatal {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Creates a timeout error carrying the remote status (if any).
    pub fn timeout(status: Option<StatusCode>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            status,
            message: msg.into(),
        }
    }

    /// Creates a transaction-state error with the given message.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::TransactionInvalid(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Returns the original remote status code, if the error came from a remote call.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::RetryExhausted { status, .. }
            | Self::AmbiguousCommitUnresolved { status, .. }
            | Self::NotCommitted { status, .. } => Some(*status),
            Self::Timeout { status, .. } | Self::Fatal { status, .. } => *status,
            Self::Parameter(_)
            | Self::TransactionInvalid(_)
            | Self::Config(_)
            | Self::Connection(_) => None,
        }
    }

    /// Returns true if the caller may retry the whole logical transaction.
    ///
    /// This is a hint for higher-level retry loops; this crate never retries
    /// these itself.
    pub fn is_retryable_by_caller(&self) -> bool {
        match self {
            Self::NotCommitted { .. } | Self::RetryExhausted { .. } | Self::Timeout { .. } => true,
            Self::Fatal { status, .. } => status.is_some_and(|s| s.is_session_related()),
            _ => false,
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parameter(_) => "Parameter Error",
            Self::RetryExhausted { .. } => "Retry Exhausted",
            Self::TransactionInvalid(_) => "Transaction State Error",
            Self::AmbiguousCommitUnresolved { .. } => "Unresolved Commit",
            Self::NotCommitted { .. } => "Not Committed",
            Self::Timeout { .. } => "Timeout",
            Self::Fatal { .. } => "Fatal Error",
            Self::Config(_) => "Configuration Error",
            Self::Connection(_) => "Connection Error",
        }
    }
}

/// Result type alias using TxGuardError.
pub type Result<T> = std::result::Result<T, TxGuardError>;
