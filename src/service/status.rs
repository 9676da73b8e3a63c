//! Remote status model.
//!
//! Every failed call into a [`QueryService`](super::QueryService) reports a
//! [`Status`]: a status code plus a human-readable message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status codes reported by the remote query service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    /// The server-side session is gone or unusable.
    BadSession,
    /// The session is busy serving another request.
    SessionBusy,
    /// The session expired on the server.
    SessionExpired,
    /// The server aborted the transaction without applying it.
    Aborted,
    /// The service is temporarily unavailable.
    Unavailable,
    /// The transport failed before a response arrived.
    TransportUnavailable,
    /// The server cannot tell whether the request was applied.
    Undetermined,
    /// The server-side operation deadline expired.
    Timeout,
    /// The request was cancelled.
    Cancelled,
    /// The client-side deadline expired before a response arrived.
    ClientDeadlineExceeded,
    Overloaded,
    BadRequest,
    SchemeError,
    PreconditionFailed,
    Unauthorized,
    NotFound,
    InternalError,
    GenericError,
}

impl StatusCode {
    /// Returns true for statuses caused by losing or contending for a session.
    pub fn is_session_related(&self) -> bool {
        matches!(
            self,
            Self::BadSession | Self::SessionBusy | Self::SessionExpired
        )
    }

    /// Returns true for deadline and cancellation statuses.
    pub fn is_deadline(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Cancelled | Self::ClientDeadlineExceeded
        )
    }

    /// Returns true for statuses after which a request may or may not have been applied.
    pub fn is_undetermined(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::TransportUnavailable | Self::Undetermined
        )
    }

    /// Returns the code as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::BadSession => "BAD_SESSION",
            Self::SessionBusy => "SESSION_BUSY",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Aborted => "ABORTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            Self::Undetermined => "UNDETERMINED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::ClientDeadlineExceeded => "CLIENT_DEADLINE_EXCEEDED",
            Self::Overloaded => "OVERLOADED",
            Self::BadRequest => "BAD_REQUEST",
            Self::SchemeError => "SCHEME_ERROR",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
            Self::GenericError => "GENERIC_ERROR",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote failure: status code plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

/// Result of a single call into the query service.
pub type ServiceResult<T> = std::result::Result<T, Status>;
