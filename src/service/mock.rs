//! In-memory query service.
//!
//! Stores rows for tables created through `ensure_table`, stages writes per
//! transaction, and lets tests script failures per call kind, including
//! commits that apply and then report a failure (an ambiguous outcome).

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::OnceLock;
use std::time::Duration;

use super::{
    ColumnInfo, QueryResult, QueryService, Row, ServiceResult, Status, StatusCode, TableSchema,
    TxHandle, TxMode, Value,
};
use crate::query::ParamSet;

/// Kinds of calls that can be scripted and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Begin,
    Send,
    Commit,
    Rollback,
    EnsureTable,
    ReadByKey,
}

/// A scripted reaction to the next call of some kind.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Fail with this status without applying anything.
    Fail(Status),
    /// Apply the call, then report this status.
    ApplyThenFail(Status),
    /// Sleep before serving the call normally.
    Delay(Duration),
}

#[derive(Debug, Default)]
struct TableData {
    columns: Vec<String>,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug)]
enum StagedWrite {
    Row { table: String, key: String, row: Row },
    Statement(String),
}

#[derive(Debug)]
struct OpenTx {
    mode: TxMode,
    writes: Vec<StagedWrite>,
}

#[derive(Debug, Default)]
struct MockState {
    tables: HashMap<String, TableData>,
    open: HashMap<String, OpenTx>,
    committed_statements: Vec<String>,
    script: HashMap<CallKind, VecDeque<ScriptedFailure>>,
    calls: HashMap<CallKind, usize>,
    next_tx: u64,
    next_session: u64,
    closed: bool,
}

/// A mock query service backed by in-process maps.
#[derive(Debug, Default)]
pub struct MockQueryService {
    state: Mutex<MockState>,
}

fn insert_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*(?:INSERT|UPSERT|REPLACE)\s+INTO\s+([A-Za-z0-9_."`]+)"#)
            .expect("insert pattern is valid")
    })
}

fn select_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*SELECT\b.*?\bFROM\s+([A-Za-z0-9_."`]+)"#)
            .expect("select pattern is valid")
    })
}

impl MockQueryService {
    /// Creates a new empty mock service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table directly, bypassing scripting.
    pub fn with_table(self, name: &str, columns: &[&str]) -> Self {
        self.state.lock().tables.insert(
            name.to_string(),
            TableData {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
            },
        );
        self
    }

    /// Scripts the next call of `kind`. Scripts for one kind run in FIFO order.
    pub fn script(&self, kind: CallKind, failure: ScriptedFailure) {
        self.state
            .lock()
            .script
            .entry(kind)
            .or_default()
            .push_back(failure);
    }

    /// Scripts the next call of `kind` to fail with `code`.
    pub fn fail_next(&self, kind: CallKind, code: StatusCode) {
        self.script(
            kind,
            ScriptedFailure::Fail(Status::new(code, format!("scripted {:?} failure", kind))),
        );
    }

    /// Scripts the next commit to apply and then report `code`.
    pub fn fail_commit_after_apply(&self, code: StatusCode) {
        self.script(
            CallKind::Commit,
            ScriptedFailure::ApplyThenFail(Status::new(code, "connection lost after commit")),
        );
    }

    /// Number of calls of `kind` served so far, including failed ones.
    pub fn call_count(&self, kind: CallKind) -> usize {
        self.state.lock().calls.get(&kind).copied().unwrap_or(0)
    }

    /// Statements applied outside service-managed tables, in commit order.
    pub fn committed_statements(&self) -> Vec<String> {
        self.state.lock().committed_statements.clone()
    }

    /// Committed rows of a table, ordered by key.
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.lock().tables.contains_key(table)
    }

    /// Writes a committed row directly.
    pub fn insert_row(&self, table: &str, key: &str, row: Row) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .rows
            .insert(key.to_string(), row);
    }

    /// Number of transactions begun but neither committed nor rolled back.
    pub fn open_transactions(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Counts the call and applies any scripted reaction.
    ///
    /// Returns a status to report after the call has been applied.
    async fn enter(&self, kind: CallKind) -> ServiceResult<Option<Status>> {
        let scripted = {
            let mut state = self.state.lock();
            *state.calls.entry(kind).or_default() += 1;
            if state.closed {
                return Err(Status::new(
                    StatusCode::TransportUnavailable,
                    "service is closed",
                ));
            }
            state.script.get_mut(&kind).and_then(VecDeque::pop_front)
        };
        match scripted {
            None => Ok(None),
            Some(ScriptedFailure::Fail(status)) => Err(status),
            Some(ScriptedFailure::ApplyThenFail(status)) => Ok(Some(status)),
            Some(ScriptedFailure::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
        }
    }
}

/// Table path as stored by `ensure_table`, with identifier quotes removed.
fn table_path(captured: &str) -> String {
    captured.chars().filter(|c| !matches!(c, '"' | '`')).collect()
}

fn deferred(status: Option<Status>) -> ServiceResult<()> {
    match status {
        Some(status) => Err(status),
        None => Ok(()),
    }
}

fn apply_write(state: &mut MockState, write: StagedWrite) {
    match write {
        StagedWrite::Row { table, key, row } => {
            state.tables.entry(table).or_default().rows.insert(key, row);
        }
        StagedWrite::Statement(sql) => state.committed_statements.push(sql),
    }
}

fn tx_not_found(tx: &TxHandle) -> Status {
    Status::new(
        StatusCode::NotFound,
        format!("transaction {} not found", tx.id),
    )
}

#[async_trait]
impl QueryService for MockQueryService {
    async fn begin_transaction(&self, mode: TxMode) -> ServiceResult<TxHandle> {
        let after = self.enter(CallKind::Begin).await?;
        let handle = {
            let mut state = self.state.lock();
            state.next_tx += 1;
            state.next_session += 1;
            let handle = TxHandle {
                id: format!("mock-tx-{}", state.next_tx),
                session_id: format!("mock-session-{}", state.next_session),
            };
            state.open.insert(
                handle.id.clone(),
                OpenTx {
                    mode,
                    writes: Vec::new(),
                },
            );
            handle
        };
        deferred(after)?;
        Ok(handle)
    }

    async fn send(
        &self,
        query: &str,
        params: &ParamSet,
        tx: Option<&TxHandle>,
    ) -> ServiceResult<QueryResult> {
        let after = self.enter(CallKind::Send).await?;
        let result = {
            let mut state = self.state.lock();
            if let Some(tx) = tx {
                let open = state.open.get(&tx.id).ok_or_else(|| tx_not_found(tx))?;
                if open.mode == TxMode::ReadOnly && !query.trim_start().to_uppercase().starts_with("SELECT") {
                    return Err(Status::new(
                        StatusCode::BadRequest,
                        "write in read-only transaction",
                    ));
                }
            }

            let insert_target = insert_regex()
                .captures(query)
                .map(|c| table_path(&c[1]))
                .filter(|t| state.tables.contains_key(t));
            let select_target = select_regex()
                .captures(query)
                .map(|c| table_path(&c[1]))
                .filter(|t| state.tables.contains_key(t));

            if let (Some(table), Some(first)) = (insert_target, params.iter().next()) {
                let write = StagedWrite::Row {
                    table,
                    key: first.value.to_display_string(),
                    row: params.iter().map(|p| p.value.clone()).collect(),
                };
                match tx {
                    Some(tx) => state
                        .open
                        .get_mut(&tx.id)
                        .ok_or_else(|| tx_not_found(tx))?
                        .writes
                        .push(write),
                    None => apply_write(&mut state, write),
                }
                QueryResult::affected(1)
            } else if let Some(table) = select_target {
                let data = &state.tables[&table];
                QueryResult::with_data(
                    data.columns.iter().map(|c| ColumnInfo::new(c, "mock")).collect(),
                    data.rows.values().cloned().collect(),
                )
            } else if query.trim_start().to_uppercase().starts_with("SELECT") {
                QueryResult::with_data(
                    vec![ColumnInfo::new("result", "text")],
                    vec![vec![Value::String(format!("Mock result for: {}", query))]],
                )
            } else {
                let write = StagedWrite::Statement(query.to_string());
                match tx {
                    Some(tx) => state
                        .open
                        .get_mut(&tx.id)
                        .ok_or_else(|| tx_not_found(tx))?
                        .writes
                        .push(write),
                    None => apply_write(&mut state, write),
                }
                QueryResult::affected(0)
            }
        };
        deferred(after)?;
        Ok(result.with_execution_time(Duration::from_millis(1)))
    }

    async fn commit(&self, tx: &TxHandle) -> ServiceResult<()> {
        let after = self.enter(CallKind::Commit).await?;
        {
            let mut state = self.state.lock();
            let open = state.open.remove(&tx.id).ok_or_else(|| tx_not_found(tx))?;
            for write in open.writes {
                apply_write(&mut state, write);
            }
        }
        deferred(after)
    }

    async fn rollback(&self, tx: &TxHandle) -> ServiceResult<()> {
        let after = self.enter(CallKind::Rollback).await?;
        self.state.lock().open.remove(&tx.id);
        deferred(after)
    }

    async fn ensure_table(&self, name: &str, schema: &TableSchema) -> ServiceResult<()> {
        let after = self.enter(CallKind::EnsureTable).await?;
        self.state
            .lock()
            .tables
            .entry(name.to_string())
            .or_insert_with(|| TableData {
                columns: schema.column_names().iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
            });
        deferred(after)
    }

    async fn read_by_key(&self, table: &str, key: &str) -> ServiceResult<Option<Row>> {
        let after = self.enter(CallKind::ReadByKey).await?;
        let row = {
            let state = self.state.lock();
            let data = state.tables.get(table).ok_or_else(|| {
                Status::new(StatusCode::SchemeError, format!("table {} does not exist", table))
            })?;
            data.rows.get(key).cloned()
        };
        deferred(after)?;
        Ok(row)
    }

    async fn close(&self) -> ServiceResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.open.clear();
        Ok(())
    }
}
