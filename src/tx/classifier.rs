//! Maps remote failures to a retry disposition.
//!
//! The table here is a compatibility contract: callers rely on which
//! failures are retried transparently and which are surfaced.

use std::fmt;

use crate::service::StatusCode;

/// Round trip during which a status was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Statement send (or begin) before any commit was requested.
    Execute,
    /// The commit round trip itself.
    Commit,
}

/// What the coordinator should do about an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// No side effects are possible. Retry once on a fresh session.
    RetryableFresh,
    /// The transaction was aborted. Retry once in a new transaction.
    RetryableNewTx,
    /// The outcome is ambiguous. Consult the validator.
    ConditionallyRetryable,
    /// Deadline or cancellation. Never retried.
    Timeout,
    Fatal,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::RetryableFresh => "retryable (fresh session)",
            Self::RetryableNewTx => "retryable (new transaction)",
            Self::ConditionallyRetryable => "conditionally retryable",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Classifies `status` observed during `phase`.
///
/// `first_statement` is true when no transaction state exists yet, which
/// includes every statement run under auto-commit.
pub fn classify(status: StatusCode, phase: Phase, first_statement: bool) -> Disposition {
    if status == StatusCode::Success {
        return Disposition::Success;
    }
    if status.is_session_related() {
        return if first_statement {
            Disposition::RetryableFresh
        } else {
            Disposition::Fatal
        };
    }
    if status == StatusCode::Aborted {
        return Disposition::RetryableNewTx;
    }
    if status.is_deadline() {
        return Disposition::Timeout;
    }
    if status.is_undetermined() && phase == Phase::Commit {
        return Disposition::ConditionallyRetryable;
    }
    Disposition::Fatal
}
