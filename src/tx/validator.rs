//! Ambiguous-commit resolution through a marker table.
//!
//! Every read-write transaction writes one marker row keyed by its
//! transaction id before commit. The row commits atomically with the
//! caller's writes, so after an ambiguous commit a point lookup tells
//! whether the transaction applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Result, TxGuardError};
use crate::query::{ParamSet, ParamType};
use crate::service::{QueryService, Row, StatusCode, TableSchema, Value};

const TX_ID_COLUMN: &str = "transaction_id";
const COMMITTED_AT_COLUMN: &str = "committed_at";

/// One marker row.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRecord {
    pub transaction_id: String,
    pub committed_at: DateTime<Utc>,
}

impl ValidationRecord {
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            committed_at: Utc::now(),
        }
    }

    /// Parses a row in `(transaction_id, committed_at)` column order.
    pub fn from_row(row: &Row) -> Option<Self> {
        match row.as_slice() {
            [Value::String(id), Value::Timestamp(at), ..] => Some(Self {
                transaction_id: id.clone(),
                committed_at: *at,
            }),
            _ => None,
        }
    }

    /// Parameters for the marker insert.
    pub fn to_params(&self) -> ParamSet {
        ParamSet::new()
            .with(TX_ID_COLUMN, ParamType::Text, self.transaction_id.as_str())
            .with(COMMITTED_AT_COLUMN, ParamType::Timestamp, self.committed_at)
    }
}

/// Result of resolving an ambiguous commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The marker row exists; the transaction committed.
    Committed,
    /// No marker row; the transaction did not apply.
    NotCommitted,
    /// The lookup itself failed.
    Unresolved(String),
}

/// Validates a marker table path.
///
/// Accepts `name` or `schema.name` made of ASCII alphanumerics and
/// underscores. Case is kept: the name is always quoted when used.
pub fn validate_table_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        TxGuardError::config(format!(
            "Invalid transaction validation table '{name}': {reason}"
        ))
    };

    if name.trim().is_empty() {
        return Err(invalid("name is empty"));
    }
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() > 2 {
        return Err(invalid("expected 'table' or 'schema.table'"));
    }
    for segment in segments {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid("only letters, digits and '_' are allowed"));
        }
        if segment.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(invalid("segments may not start with a digit"));
        }
    }
    Ok(())
}

/// Quotes each segment of an already validated table path.
fn quoted_path(table: &str) -> String {
    table
        .split('.')
        .map(|segment| format!("\"{segment}\""))
        .collect::<Vec<_>>()
        .join(".")
}

/// Schema of the marker table.
pub fn marker_schema() -> TableSchema {
    TableSchema::new(
        vec![
            (TX_ID_COLUMN, ParamType::Text),
            (COMMITTED_AT_COLUMN, ParamType::Timestamp),
        ],
        &[TX_ID_COLUMN],
    )
}

/// Writes and looks up marker rows in one table.
#[derive(Clone)]
pub struct TxValidator {
    service: Arc<dyn QueryService>,
    table: String,
    timeout: Duration,
}

impl std::fmt::Debug for TxValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxValidator")
            .field("table", &self.table)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TxValidator {
    /// Creates a validator for `table`. The name is checked locally.
    pub fn new(service: Arc<dyn QueryService>, table: &str, timeout: Duration) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            service,
            table: table.to_string(),
            timeout,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the marker table if absent.
    ///
    /// Failures are configuration errors naming the table.
    pub async fn ensure(&self) -> Result<()> {
        let schema = marker_schema();
        let outcome = tokio::time::timeout(
            self.timeout,
            self.service.ensure_table(&self.table, &schema),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                debug!("Transaction validation table '{}' is ready", self.table);
                Ok(())
            }
            Ok(Err(status)) => Err(TxGuardError::config(format!(
                "Cannot create transaction validation table '{}': {}",
                self.table, status
            ))),
            Err(_) => Err(TxGuardError::config(format!(
                "Timed out creating transaction validation table '{}' after {:?}",
                self.table, self.timeout
            ))),
        }
    }

    /// Insert statement for a marker row, using named parameters.
    ///
    /// Identifiers are quoted the same way `ensure_table` creates them, so
    /// mixed-case names address the same relation.
    pub fn marker_statement(&self) -> String {
        format!(
            "INSERT INTO {} (\"{TX_ID_COLUMN}\", \"{COMMITTED_AT_COLUMN}\") VALUES (${TX_ID_COLUMN}, ${COMMITTED_AT_COLUMN})",
            quoted_path(&self.table)
        )
    }

    /// Looks up the marker for `tx_id` after a commit ended with `status`.
    ///
    /// Never recurses: a failed lookup is reported as unresolved.
    pub async fn resolve(&self, tx_id: &str, status: StatusCode) -> Resolution {
        info!(
            "Commit of transaction {} ended with {}, checking marker table '{}'",
            tx_id, status, self.table
        );

        let lookup =
            tokio::time::timeout(self.timeout, self.service.read_by_key(&self.table, tx_id)).await;

        match lookup {
            Ok(Ok(Some(row))) => {
                match ValidationRecord::from_row(&row) {
                    Some(record) => debug!(
                        "Found marker for {} committed at {}",
                        record.transaction_id, record.committed_at
                    ),
                    None => debug!("Found marker for {}", tx_id),
                }
                Resolution::Committed
            }
            Ok(Ok(None)) => {
                info!("No marker for transaction {}; it was not committed", tx_id);
                Resolution::NotCommitted
            }
            Ok(Err(lookup_status)) => {
                warn!(
                    "Marker lookup for transaction {} failed: {}",
                    tx_id, lookup_status
                );
                Resolution::Unresolved(format!(
                    "marker lookup in '{}' failed: {}",
                    self.table, lookup_status
                ))
            }
            Err(_) => {
                warn!(
                    "Marker lookup for transaction {} timed out after {:?}",
                    tx_id, self.timeout
                );
                Resolution::Unresolved(format!(
                    "marker lookup in '{}' timed out after {:?}",
                    self.table, self.timeout
                ))
            }
        }
    }
}
