//! Query-service abstraction layer.
//!
//! Provides a trait-based interface for the remote query/transaction service,
//! allowing different backends to be used interchangeably. The execution
//! core only ever talks to a `dyn QueryService`.

mod mock;
mod postgres;
mod status;
mod types;

pub use mock::{CallKind, MockQueryService, ScriptedFailure};
pub use postgres::PostgresQueryService;
pub use status::{ServiceResult, Status, StatusCode};
pub use types::{ColumnInfo, QueryResult, Row, Value};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::query::{ParamSet, ParamType};

/// Supported query-service backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process service, mainly for tests and dry runs.
    #[default]
    Memory,
    Postgres,
}

impl Backend {
    /// Returns the backend as a string for display and config.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }

    /// Parses a backend from a string or URL scheme.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Returns the default port for this backend, if it has one.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Memory => None,
            Self::Postgres => Some(5432),
        }
    }
}

/// Handle of a remote transaction, as assigned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxHandle {
    /// Transaction id assigned by the service.
    pub id: String,
    /// Server-side session the transaction is bound to.
    pub session_id: String,
}

/// Transaction mode requested on begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxMode {
    #[default]
    SerializableReadWrite,
    ReadOnly,
}

/// Column of a table created through [`QueryService::ensure_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ParamType,
}

/// Minimal table schema used for service-managed tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(columns: Vec<(&str, ParamType)>, primary_key: &[&str]) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, ty)| ColumnDef {
                    name: name.to_string(),
                    ty,
                })
                .collect(),
            primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Interface to the remote query/transaction service.
///
/// Every call reports failures as a [`Status`]; interpreting them is the
/// caller's job.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Opens a new transaction on a fresh or pooled session.
    async fn begin_transaction(&self, mode: TxMode) -> ServiceResult<TxHandle>;

    /// Sends a normalized query with its parameters, optionally inside `tx`.
    async fn send(
        &self,
        query: &str,
        params: &ParamSet,
        tx: Option<&TxHandle>,
    ) -> ServiceResult<QueryResult>;

    /// Commits `tx`.
    async fn commit(&self, tx: &TxHandle) -> ServiceResult<()>;

    /// Rolls back `tx`. Callers treat this as best-effort.
    async fn rollback(&self, tx: &TxHandle) -> ServiceResult<()>;

    /// Creates `name` with `schema` if it does not exist.
    async fn ensure_table(&self, name: &str, schema: &TableSchema) -> ServiceResult<()>;

    /// Point lookup by primary key against the latest committed state.
    async fn read_by_key(&self, table: &str, key: &str) -> ServiceResult<Option<Row>>;

    /// Releases the session pool.
    async fn close(&self) -> ServiceResult<()>;
}

/// Creates query services for configurations.
///
/// The context cache calls this once per cache miss.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn QueryService>>;
}

/// Factory dispatching on [`ConnectionConfig::backend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BackendFactory;

#[async_trait]
impl ServiceFactory for BackendFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn QueryService>> {
        connect(config).await
    }
}

/// Creates a query service for the given configuration.
///
/// This is the central factory function for service connections.
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn QueryService>> {
    match config.backend {
        Backend::Memory => Ok(Arc::new(MockQueryService::new())),
        Backend::Postgres => {
            let service = PostgresQueryService::connect(config).await?;
            Ok(Arc::new(service))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!(Backend::parse("postgresql"), Some(Backend::Postgres));
        assert_eq!(Backend::parse("MEMORY"), Some(Backend::Memory));
        assert_eq!(Backend::parse("mysql"), None);
        assert_eq!(Backend::Postgres.default_port(), Some(5432));
    }

    #[test]
    fn test_table_schema_columns() {
        let schema = TableSchema::new(
            vec![("transaction_id", ParamType::Text), ("committed_at", ParamType::Timestamp)],
            &["transaction_id"],
        );
        assert_eq!(schema.column_names(), vec!["transaction_id", "committed_at"]);
        assert_eq!(schema.primary_key, vec!["transaction_id".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = ConnectionConfig::memory("unit");
        let service = connect(&config).await.unwrap();
        let tx = service.begin_transaction(TxMode::default()).await.unwrap();
        service.commit(&tx).await.unwrap();
    }
}
