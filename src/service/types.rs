//! Value and result types exchanged with the query service.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Outcome of one statement: a row set, an affected-row count, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    /// Round-trip time as measured by the service.
    pub execution_time: Duration,
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result carrying a row set.
    pub fn with_data(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }

    /// Result of a write that returned no rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn with_execution_time(mut self, execution_time: Duration) -> Self {
        self.execution_time = execution_time;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows came back. Writes are always empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Name and backend type name of a result column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// One result row, in column order.
pub type Row = Vec<Value>;

/// A parameter or column value.
///
/// The variants cover what parameters can be bound as; wider backend types
/// are narrowed on the way in (all integers to `Int`, all text to `String`).
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the value's kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
        }
    }

    /// Renders the value for tables and logs. Bytes show only their length.
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => format!("<{} bytes>", b.len()),
            Self::Timestamp(ts) => ts.to_rfc3339(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v $(as $cast)?)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int as i64,
    i64 => Int,
    f64 => Float,
    String => String,
    Vec<u8> => Bytes,
    DateTime<Utc> => Timestamp,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_display_strings() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cases = [
            (Value::Null, "NULL"),
            (Value::Bool(false), "false"),
            (Value::Int(-7), "-7"),
            (Value::from("tx-1"), "tx-1"),
            (Value::Bytes(vec![0; 16]), "<16 bytes>"),
            (Value::Timestamp(ts), "2024-05-01T12:00:00+00:00"),
        ];
        for (value, expected) in cases {
            assert_eq!(value.to_string(), expected);
        }
    }

    #[test]
    fn test_optional_values() {
        assert_eq!(Value::from(None::<&str>), Value::Null);
        assert_eq!(Value::from(Some(7i32)), Value::Int(7));
        assert!(Value::from(None::<i64>).is_null());
    }

    #[test]
    fn test_write_result_has_no_rows() {
        let result = QueryResult::affected(3).with_execution_time(Duration::from_millis(2));
        assert!(result.is_empty());
        assert_eq!(result.rows_affected, 3);
        assert_eq!(result.execution_time, Duration::from_millis(2));
    }

    #[test]
    fn test_row_set_keeps_column_order() {
        let result = QueryResult::with_data(
            vec![
                ColumnInfo::new("transaction_id", "text"),
                ColumnInfo::new("committed_at", "timestamptz"),
            ],
            vec![vec![Value::from("tx-9"), Value::Null]],
        );
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.columns[1].name, "committed_at");
        assert_eq!(result.rows_affected, 0);
    }
}
