//! Query, parameter type and parameter set definitions.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::service::Value;

/// Declared type of a query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Bool,
    Int32,
    Int64,
    Double,
    Text,
    Bytes,
    Timestamp,
    /// Nullable wrapper around another type.
    Optional(Box<ParamType>),
}

/// Why a raw value could not be converted to a declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoerceError {
    /// NULL supplied for a non-nullable type.
    Missing,
    /// Value of a kind the type's setter does not accept.
    Mismatch(&'static str),
}

impl ParamType {
    /// Wraps this type as nullable. Already-optional types are returned unchanged.
    pub fn optional(self) -> Self {
        match self {
            Self::Optional(_) => self,
            other => Self::Optional(Box::new(other)),
        }
    }

    /// Returns true if NULL is a valid value for this type.
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Optional(_))
    }

    /// Returns the non-nullable type underneath any Optional wrapper.
    pub fn base(&self) -> &ParamType {
        match self {
            Self::Optional(inner) => inner.base(),
            other => other,
        }
    }

    /// Parses a declared type name (`Int64`, `Utf8?`, `Optional<Timestamp>`).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix('?') {
            return Self::parse(inner).map(Self::optional);
        }
        let lower = s.to_lowercase();
        if let Some(inner) = lower
            .strip_prefix("optional<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return Self::parse(inner).map(Self::optional);
        }
        match lower.as_str() {
            "bool" | "boolean" => Some(Self::Bool),
            "int32" | "int" | "integer" => Some(Self::Int32),
            "int64" | "bigint" => Some(Self::Int64),
            "double" | "float8" => Some(Self::Double),
            "utf8" | "text" | "varchar" => Some(Self::Text),
            "string" | "bytes" | "bytea" => Some(Self::Bytes),
            "timestamp" | "timestamptz" => Some(Self::Timestamp),
            _ => None,
        }
    }

    /// Infers the type of a raw value. NULL has no inferable type.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::Int(_) => Some(Self::Int64),
            Value::Float(_) => Some(Self::Double),
            Value::String(_) => Some(Self::Text),
            Value::Bytes(_) => Some(Self::Bytes),
            Value::Timestamp(_) => Some(Self::Timestamp),
        }
    }

    /// Converts a raw value through this type's setter.
    pub fn coerce(&self, value: Value) -> Result<Value, CoerceError> {
        if let Self::Optional(inner) = self {
            return match value {
                Value::Null => Ok(Value::Null),
                other => inner.coerce(other),
            };
        }
        let kind = value.kind_name();
        let converted = match (self, value) {
            (_, Value::Null) => return Err(CoerceError::Missing),
            (Self::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
            (Self::Bool, Value::String(s)) => s.trim().parse::<bool>().ok().map(Value::Bool),
            (Self::Int32, Value::Int(i)) => i32::try_from(i).ok().map(|_| Value::Int(i)),
            (Self::Int32, Value::String(s)) => {
                s.trim().parse::<i32>().ok().map(|i| Value::Int(i as i64))
            }
            (Self::Int64, Value::Int(i)) => Some(Value::Int(i)),
            (Self::Int64, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::Int),
            (Self::Double, Value::Float(f)) => Some(Value::Float(f)),
            (Self::Double, Value::Int(i)) => Some(Value::Float(i as f64)),
            (Self::Double, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::Float),
            (Self::Text, Value::String(s)) => Some(Value::String(s)),
            (Self::Text, Value::Int(i)) => Some(Value::String(i.to_string())),
            (Self::Text, Value::Float(f)) => Some(Value::String(f.to_string())),
            (Self::Text, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (Self::Bytes, Value::Bytes(b)) => Some(Value::Bytes(b)),
            (Self::Bytes, Value::String(s)) => Some(Value::Bytes(s.into_bytes())),
            (Self::Timestamp, Value::Timestamp(ts)) => Some(Value::Timestamp(ts)),
            (Self::Timestamp, Value::Int(millis)) => {
                Utc.timestamp_millis_opt(millis).single().map(Value::Timestamp)
            }
            (Self::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|ts| Value::Timestamp(ts.with_timezone(&Utc))),
            _ => None,
        };
        converted.ok_or(CoerceError::Mismatch(kind))
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "Bool"),
            Self::Int32 => write!(f, "Int32"),
            Self::Int64 => write!(f, "Int64"),
            Self::Double => write!(f, "Double"),
            Self::Text => write!(f, "Utf8"),
            Self::Bytes => write!(f, "String"),
            Self::Timestamp => write!(f, "Timestamp"),
            Self::Optional(inner) => write!(f, "Optional<{}>", inner),
        }
    }
}

/// A value that already carries its type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub ty: ParamType,
    pub value: Value,
}

impl TypedValue {
    pub fn new(ty: ParamType, value: impl Into<Value>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }

    /// Typed NULL of the optional form of `ty`.
    pub fn null(ty: ParamType) -> Self {
        Self {
            ty: ty.optional(),
            value: Value::Null,
        }
    }
}

/// Value handed to the binder: either raw or already typed.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Raw(Value),
    Typed(TypedValue),
}

impl From<Value> for BindValue {
    fn from(v: Value) -> Self {
        Self::Raw(v)
    }
}

impl From<TypedValue> for BindValue {
    fn from(v: TypedValue) -> Self {
        Self::Typed(v)
    }
}

/// One bound parameter: `(name, type, value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub name: String,
    pub ty: ParamType,
    pub value: Value,
}

/// Ordered parameter set for one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    params: Vec<BoundParam>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: Vec<BoundParam>) -> Self {
        Self { params }
    }

    /// Appends a parameter. Used when building sets outside the binder.
    pub fn with(mut self, name: impl Into<String>, ty: ParamType, value: impl Into<Value>) -> Self {
        self.params.push(BoundParam {
            name: name.into(),
            ty,
            value: value.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundParam> {
        self.params.iter()
    }

    /// Looks up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&BoundParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// 1-based position of `name` in this set.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name).map(|i| i + 1)
    }

    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Classification tag of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryKind {
    /// Schema changes (CREATE, ALTER, DROP, ...). Never run inside a transaction.
    Scheme,
    /// Regular reads and writes, run inside the current transaction.
    Data,
    /// Read-only streaming scan, run outside any transaction.
    Scan,
    /// Plan inspection, run outside any transaction.
    Explain,
    /// Bulk write.
    Bulk,
}

impl QueryKind {
    /// Returns true if the query runs inside the connection's transaction.
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Data | Self::Bulk)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheme => write!(f, "SCHEME"),
            Self::Data => write!(f, "DATA"),
            Self::Scan => write!(f, "SCAN"),
            Self::Explain => write!(f, "EXPLAIN"),
            Self::Bulk => write!(f, "BULK"),
        }
    }
}

/// An immutable, reusable query.
///
/// Parameter names are stored without the leading `$`. A declared type of
/// `None` means the type is taken from the bound value at bind time.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    text: String,
    normalized: String,
    kind: QueryKind,
    params: BTreeMap<String, Option<ParamType>>,
}

impl Query {
    pub(crate) fn from_parts(
        text: String,
        normalized: String,
        kind: QueryKind,
        params: BTreeMap<String, Option<ParamType>>,
    ) -> Self {
        Self {
            text,
            normalized,
            kind,
            params,
        }
    }

    /// Parses and classifies `sql`.
    pub fn parse(sql: &str) -> crate::error::Result<Self> {
        super::parser::parse_query(sql)
    }

    /// Declares (or overrides) the type of a parameter.
    pub fn with_param_type(mut self, name: &str, ty: ParamType) -> Self {
        let name = name.strip_prefix('$').unwrap_or(name);
        self.params.insert(name.to_string(), Some(ty));
        self
    }

    /// Original text as submitted.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text after dialect rewrites, as sent to the service.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Declared parameter mapping, name → type.
    pub fn params(&self) -> &BTreeMap<String, Option<ParamType>> {
        &self.params
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_names() {
        assert_eq!(ParamType::parse("Int64"), Some(ParamType::Int64));
        assert_eq!(ParamType::parse("utf8"), Some(ParamType::Text));
        assert_eq!(
            ParamType::parse("Int32?"),
            Some(ParamType::Optional(Box::new(ParamType::Int32)))
        );
        assert_eq!(
            ParamType::parse("Optional<Timestamp>"),
            Some(ParamType::Timestamp.optional())
        );
        assert_eq!(ParamType::parse("Decimal(22,9)"), None);
    }

    #[test]
    fn test_optional_is_idempotent() {
        let ty = ParamType::Int64.optional().optional();
        assert_eq!(ty, ParamType::Optional(Box::new(ParamType::Int64)));
        assert_eq!(ty.base(), &ParamType::Int64);
        assert_eq!(ty.to_string(), "Optional<Int64>");
    }

    #[test]
    fn test_coerce_raw_values() {
        assert_eq!(ParamType::Double.coerce(Value::Int(2)), Ok(Value::Float(2.0)));
        assert_eq!(ParamType::Int64.coerce(Value::from("17")), Ok(Value::Int(17)));
        assert_eq!(
            ParamType::Int32.coerce(Value::Int(i64::MAX)),
            Err(CoerceError::Mismatch("integer"))
        );
        assert_eq!(ParamType::Text.coerce(Value::Null), Err(CoerceError::Missing));
        assert_eq!(ParamType::Text.optional().coerce(Value::Null), Ok(Value::Null));
        assert_eq!(
            ParamType::Bool.coerce(Value::Bytes(vec![1])),
            Err(CoerceError::Mismatch("bytes"))
        );
    }

    #[test]
    fn test_coerce_timestamp() {
        let ts = ParamType::Timestamp
            .coerce(Value::from("2024-05-01T12:00:00Z"))
            .unwrap();
        let Value::Timestamp(parsed) = ts else {
            panic!("expected timestamp");
        };
        assert_eq!(parsed.timestamp(), 1_714_564_800);

        let from_millis = ParamType::Timestamp.coerce(Value::Int(1_714_564_800_000)).unwrap();
        assert_eq!(from_millis, Value::Timestamp(parsed));
    }

    #[test]
    fn test_param_set_lookup() {
        let set = ParamSet::new()
            .with("p1", ParamType::Int64, 1i64)
            .with("name", ParamType::Text, "x");
        assert_eq!(set.len(), 2);
        assert_eq!(set.position("name"), Some(2));
        assert_eq!(set.get("p1").map(|p| &p.value), Some(&Value::Int(1)));
        assert!(set.get("missing").is_none());
    }
}
