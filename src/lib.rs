//! txguard - retry-safe query execution with ambiguous-commit resolution.
//!
//! Statements are bound by a [`query::ParamBinder`], executed through a
//! [`tx::TransactionCoordinator`] and sent to a [`service::QueryService`].
//! Connections opened with equal configurations share one
//! [`context::Context`] through the [`context::ContextCache`].

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod logging;
pub mod query;
pub mod service;
pub mod tx;

pub use config::{Config, ConnectionConfig};
pub use connection::{Connection, Driver};
pub use error::{Result, TxGuardError};
