//! PostgreSQL query service implementation.
//!
//! Provides the `PostgresQueryService` struct that implements the
//! `QueryService` trait on top of a sqlx connection pool. Open transactions
//! are kept server-side and addressed by their `txid_current()` value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query as SqlxQuery;
use sqlx::{Column as SqlxColumn, Postgres, Row as SqlxRow, Transaction, TypeInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    ColumnInfo, QueryResult, QueryService, Row, ServiceResult, Status, StatusCode, TableSchema,
    TxHandle, TxMode, Value,
};
use crate::config::ConnectionConfig;
use crate::error::{Result, TxGuardError};
use crate::query::parser::substitute_named;
use crate::query::{BoundParam, ParamSet, ParamType};

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

type OpenTx = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// PostgreSQL query service.
#[derive(Debug)]
pub struct PostgresQueryService {
    pool: PgPool,
    open: DashMap<String, OpenTx>,
    tables: DashMap<String, TableSchema>,
    read_only_seq: AtomicU64,
}

impl PostgresQueryService {
    /// Creates a service from an existing connection pool.
    ///
    /// This is primarily useful for testing.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            open: DashMap::new(),
            tables: DashMap::new(),
            read_only_seq: AtomicU64::new(0),
        }
    }

    /// Connects a pool sized by the configuration, retrying transient failures.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_postgres_url()?;

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            let result = PgPoolOptions::new()
                .min_connections(config.min_sessions)
                .max_connections(config.max_sessions)
                .acquire_timeout(config.connect_timeout())
                .connect(&conn_str)
                .await;

            match result {
                Ok(pool) => {
                    debug!("Successfully connected to {}", config.display_string());
                    return Ok(Self::from_pool(pool));
                }
                Err(e) => {
                    let is_transient = is_transient_error(&e);
                    last_error = Some(e);

                    if attempt < MAX_RETRY_ATTEMPTS && is_transient {
                        warn!(
                            "Connection attempt {} failed (transient error), retrying in {:?}",
                            attempt, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => map_connection_error(e, config),
            None => TxGuardError::connection("No connection attempt was made"),
        })
    }

    fn open_tx(&self, tx: &TxHandle) -> ServiceResult<OpenTx> {
        self.open
            .get(&tx.id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| tx_not_found(tx))
    }

    async fn take_tx(&self, tx: &TxHandle) -> ServiceResult<Transaction<'static, Postgres>> {
        let (_, open) = self.open.remove(&tx.id).ok_or_else(|| tx_not_found(tx))?;
        let mut guard = open.lock().await;
        guard.take().ok_or_else(|| tx_not_found(tx))
    }
}

#[async_trait]
impl QueryService for PostgresQueryService {
    async fn begin_transaction(&self, mode: TxMode) -> ServiceResult<TxHandle> {
        let mut tx = self.pool.begin().await.map_err(map_error)?;

        let handle = match mode {
            TxMode::SerializableReadWrite => {
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                    .execute(&mut *tx)
                    .await
                    .map_err(map_error)?;
                let (id, session_id): (String, String) =
                    sqlx::query_as("SELECT txid_current()::text, pg_backend_pid()::text")
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(map_error)?;
                TxHandle { id, session_id }
            }
            TxMode::ReadOnly => {
                sqlx::query("SET TRANSACTION READ ONLY")
                    .execute(&mut *tx)
                    .await
                    .map_err(map_error)?;
                let session_id: String = sqlx::query_scalar("SELECT pg_backend_pid()::text")
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(map_error)?;
                let seq = self.read_only_seq.fetch_add(1, Ordering::Relaxed);
                TxHandle {
                    id: format!("ro-{}-{}", session_id, seq),
                    session_id,
                }
            }
        };

        debug!("Began transaction {} on backend {}", handle.id, handle.session_id);
        self.open
            .insert(handle.id.clone(), Arc::new(Mutex::new(Some(tx))));
        Ok(handle)
    }

    async fn send(
        &self,
        query: &str,
        params: &ParamSet,
        tx: Option<&TxHandle>,
    ) -> ServiceResult<QueryResult> {
        let sql = substitute_named(query, |name| {
            params.position(name).map(|pos| format!("${}", pos))
        });
        let returns_rows = returns_rows(&sql);

        let mut statement = sqlx::query(&sql);
        for param in params.iter() {
            statement = bind_param(statement, param);
        }

        let start = Instant::now();
        let result = match tx {
            Some(tx) => {
                let open = self.open_tx(tx)?;
                let mut guard = open.lock().await;
                let conn = guard.as_mut().ok_or_else(|| tx_not_found(tx))?;
                if returns_rows {
                    rows_result(statement.fetch_all(&mut **conn).await.map_err(map_error)?)
                } else {
                    let done = statement.execute(&mut **conn).await.map_err(map_error)?;
                    QueryResult::affected(done.rows_affected())
                }
            }
            None => {
                if returns_rows {
                    rows_result(statement.fetch_all(&self.pool).await.map_err(map_error)?)
                } else {
                    let done = statement.execute(&self.pool).await.map_err(map_error)?;
                    QueryResult::affected(done.rows_affected())
                }
            }
        };

        Ok(result.with_execution_time(start.elapsed()))
    }

    async fn commit(&self, tx: &TxHandle) -> ServiceResult<()> {
        let conn = self.take_tx(tx).await?;
        conn.commit().await.map_err(map_error)
    }

    async fn rollback(&self, tx: &TxHandle) -> ServiceResult<()> {
        let conn = self.take_tx(tx).await?;
        conn.rollback().await.map_err(map_error)
    }

    async fn ensure_table(&self, name: &str, schema: &TableSchema) -> ServiceResult<()> {
        let table = quote_table(name)?;
        let mut columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| {
                let not_null = if c.ty.is_optional() { "" } else { " NOT NULL" };
                format!("{} {}{}", quote_ident(&c.name), pg_type(&c.ty), not_null)
            })
            .collect();
        if !schema.primary_key.is_empty() {
            let keys: Vec<String> = schema.primary_key.iter().map(|k| quote_ident(k)).collect();
            columns.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        let ddl = format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", "));
        debug!("Ensuring table: {}", ddl);
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(map_error)?;

        self.tables.insert(name.to_string(), schema.clone());
        Ok(())
    }

    async fn read_by_key(&self, table: &str, key: &str) -> ServiceResult<Option<Row>> {
        let key_column = self
            .tables
            .get(table)
            .and_then(|schema| schema.primary_key.first().cloned())
            .ok_or_else(|| {
                Status::new(
                    StatusCode::SchemeError,
                    format!("table {} was not registered with ensure_table", table),
                )
            })?;

        let sql = format!(
            "SELECT * FROM {} WHERE {} = $1",
            quote_table(table)?,
            quote_ident(&key_column)
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_error)?;
        Ok(row.as_ref().map(convert_row))
    }

    async fn close(&self) -> ServiceResult<()> {
        self.open.clear();
        self.pool.close().await;
        Ok(())
    }
}

fn tx_not_found(tx: &TxHandle) -> Status {
    Status::new(
        StatusCode::NotFound,
        format!("transaction {} is not open", tx.id),
    )
}

fn rows_result(rows: Vec<PgRow>) -> QueryResult {
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                .collect()
        })
        .unwrap_or_default();
    QueryResult::with_data(columns, rows.iter().map(convert_row).collect())
}

/// Heuristic: statements whose results are rows rather than a modified-row count.
fn returns_rows(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    ["SELECT", "WITH", "EXPLAIN", "SHOW", "VALUES", "TABLE"]
        .iter()
        .any(|kw| upper.starts_with(kw))
        || upper.contains(" RETURNING ")
}

fn bind_param<'q>(
    statement: SqlxQuery<'q, Postgres, PgArguments>,
    param: &BoundParam,
) -> SqlxQuery<'q, Postgres, PgArguments> {
    let value = &param.value;
    match param.ty.base() {
        ParamType::Bool => statement.bind(match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }),
        ParamType::Int32 => statement.bind(match value {
            Value::Int(i) => i32::try_from(*i).ok(),
            _ => None,
        }),
        ParamType::Int64 => statement.bind(match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }),
        ParamType::Double => statement.bind(match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }),
        ParamType::Bytes => statement.bind(match value {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        }),
        ParamType::Timestamp => statement.bind(match value {
            Value::Timestamp(ts) => Some(*ts),
            _ => None::<DateTime<Utc>>,
        }),
        ParamType::Text | ParamType::Optional(_) => statement.bind(match value {
            Value::Null => None,
            other => Some(other.to_display_string()),
        }),
    }
}

fn pg_type(ty: &ParamType) -> &'static str {
    match ty.base() {
        ParamType::Bool => "BOOLEAN",
        ParamType::Int32 => "INTEGER",
        ParamType::Int64 => "BIGINT",
        ParamType::Double => "DOUBLE PRECISION",
        ParamType::Text | ParamType::Optional(_) => "TEXT",
        ParamType::Bytes => "BYTEA",
        ParamType::Timestamp => "TIMESTAMPTZ",
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes a `schema.table` path. Rejects names Postgres cannot address.
fn quote_table(name: &str) -> ServiceResult<String> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|p| {
            !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        return Err(Status::new(
            StatusCode::BadRequest,
            format!("'{}' is not a valid PostgreSQL table path", name),
        ));
    }
    Ok(parts
        .iter()
        .map(|p| quote_ident(p))
        .collect::<Vec<_>>()
        .join("."))
}

/// Converts a PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),

        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(|ts| Value::Timestamp(ts.and_utc()))
            .unwrap_or(Value::Null),

        // For all other types, try to get as string
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps a sqlx error to a service status.
fn map_error(error: sqlx::Error) -> Status {
    let code = match &error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => StatusCode::Aborted,
            // query_canceled (statement_timeout)
            Some("57014") => StatusCode::Cancelled,
            // admin/crash shutdown, cannot connect now
            Some("57P01") | Some("57P02") | Some("57P03") => StatusCode::Unavailable,
            Some("53300") => StatusCode::Overloaded,
            Some("25P02") => StatusCode::PreconditionFailed,
            Some(code) if code.starts_with("08") => StatusCode::BadSession,
            Some(code) if code.starts_with("23") => StatusCode::PreconditionFailed,
            Some(code) if code.starts_with("28") => StatusCode::Unauthorized,
            Some("42601") => StatusCode::BadRequest,
            Some(code) if code.starts_with("42") => StatusCode::SchemeError,
            _ => StatusCode::GenericError,
        },
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => StatusCode::TransportUnavailable,
        sqlx::Error::PoolTimedOut => StatusCode::SessionBusy,
        sqlx::Error::PoolClosed => StatusCode::Unavailable,
        sqlx::Error::WorkerCrashed | sqlx::Error::Protocol(_) => StatusCode::InternalError,
        sqlx::Error::RowNotFound => StatusCode::NotFound,
        _ => StatusCode::GenericError,
    };
    Status::new(code, format_query_error(&error))
}

/// Determines if a connection error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    // Connection refused or timeout are often transient
    if error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
    {
        return true;
    }

    // Default to not retrying unknown errors
    false
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> TxGuardError {
    let endpoint = config.endpoint.as_deref().unwrap_or("localhost");
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        TxGuardError::connection(format!(
            "Cannot connect to {endpoint}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        TxGuardError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        TxGuardError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        TxGuardError::connection(format!(
            "Connection to {endpoint} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        TxGuardError::connection(error.to_string())
    }
}

/// Formats a database error with detail and hint if available.
fn format_query_error(error: &sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from("ERROR: ");
    result.push_str(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }

        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }

        if let Some(table) = pg_error.table() {
            result.push_str("\n  TABLE: ");
            result.push_str(table);
        }
    }

    result
}
