//! Query normalization and classification.
//!
//! Normalization applies the dialect rewrites this layer understands:
//! `DECLARE $name AS Type;` headers are collected into the parameter mapping
//! and removed, `SCAN`/`BULK` prefixes are stripped into the query kind, and
//! JDBC-style `?` placeholders are rewritten to `$p1`, `$p2`, ... Statement
//! classification then uses sqlparser-rs, falling back to the leading keyword
//! for statements the generic dialect cannot parse (e.g. `UPSERT`).

use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{Result, TxGuardError};

use super::types::{ParamType, Query, QueryKind};

/// Prefix used for names generated from `?` placeholders.
pub const POSITIONAL_PREFIX: &str = "p";

fn declare_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bDECLARE\s+\$([A-Za-z_][A-Za-z0-9_]*)\s+AS\s+([^;]+?)\s*;")
            .expect("DECLARE pattern is valid")
    })
}

/// Parses, normalizes and classifies a SQL string.
pub fn parse_query(sql: &str) -> Result<Query> {
    let (body, mut params) = extract_declarations(sql)?;

    let (prefix_kind, body) = strip_kind_prefix(&body);
    let (normalized, referenced) = rewrite_placeholders(&body);
    let normalized = normalized.trim().to_string();

    if normalized.is_empty() {
        return Err(TxGuardError::fatal("Empty SQL statement"));
    }

    for name in referenced {
        params.entry(name).or_insert(None);
    }

    let kind = match prefix_kind {
        Some(kind) => kind,
        None => classify_statements(&normalized)?,
    };

    Ok(Query::from_parts(sql.to_string(), normalized, kind, params))
}

/// Returns the 1-based index encoded in a positional name (`p3` → 3).
pub fn positional_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(POSITIONAL_PREFIX)?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}

/// Collects `DECLARE $name AS Type;` headers and removes them from the text.
fn extract_declarations(sql: &str) -> Result<(String, BTreeMap<String, Option<ParamType>>)> {
    let mut params = BTreeMap::new();
    for caps in declare_regex().captures_iter(sql) {
        let name = caps[1].to_string();
        let type_name = caps[2].trim();
        let ty = ParamType::parse(type_name).ok_or_else(|| {
            TxGuardError::fatal(format!(
                "Unsupported type '{}' declared for parameter ${}",
                type_name, name
            ))
        })?;
        params.insert(name, Some(ty));
    }
    let body = declare_regex().replace_all(sql, "").into_owned();
    Ok((body, params))
}

/// Strips a leading `SCAN` or `BULK` keyword; detects `EXPLAIN`.
fn strip_kind_prefix(sql: &str) -> (Option<QueryKind>, String) {
    let Some((start, end)) = leading_keyword(sql) else {
        return (None, sql.to_string());
    };
    let word = sql[start..end].to_uppercase();
    let kind = match word.as_str() {
        "SCAN" => QueryKind::Scan,
        "BULK" => QueryKind::Bulk,
        "EXPLAIN" => return (Some(QueryKind::Explain), sql.to_string()),
        _ => return (None, sql.to_string()),
    };
    let mut rest = String::with_capacity(sql.len());
    rest.push_str(&sql[..start]);
    rest.push_str(sql[end..].trim_start());
    (Some(kind), rest)
}

/// Byte range of the first keyword, skipping whitespace and comments.
fn leading_keyword(sql: &str) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    let mut i = 0;
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if sql[i..].starts_with("--") {
            i = sql[i..].find('\n').map(|n| i + n + 1).unwrap_or(bytes.len());
        } else if sql[i..].starts_with("/*") {
            i = sql[i + 2..].find("*/").map(|n| i + n + 4).unwrap_or(bytes.len());
        } else {
            break;
        }
    }
    let start = i;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    (i > start).then_some((start, i))
}

/// A placeholder found while scanning SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder<'a> {
    /// A JDBC-style `?`.
    Positional,
    /// A `$name` reference (name without the `$`).
    Named(&'a str),
}

/// Rewrites `?` placeholders to `$pN` and collects every `$name` reference.
fn rewrite_placeholders(sql: &str) -> (String, Vec<String>) {
    let mut names: Vec<String> = Vec::new();
    let mut positional = 0usize;
    let out = map_placeholders(sql, |placeholder| match placeholder {
        Placeholder::Positional => {
            positional += 1;
            let name = format!("{}{}", POSITIONAL_PREFIX, positional);
            let replacement = format!("${}", name);
            names.push(name);
            replacement
        }
        Placeholder::Named(name) => {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
            format!("${}", name)
        }
    });
    (out, names)
}

/// Replaces `$name` references with the text returned by `lookup`.
///
/// References `lookup` does not resolve, and `?` placeholders, are kept as is.
pub fn substitute_named(sql: &str, mut lookup: impl FnMut(&str) -> Option<String>) -> String {
    map_placeholders(sql, |placeholder| match placeholder {
        Placeholder::Positional => "?".to_string(),
        Placeholder::Named(name) => lookup(name).unwrap_or_else(|| format!("${}", name)),
    })
}

/// Scans `sql`, replacing every placeholder with the visitor's output.
///
/// Quoted strings, quoted identifiers, comments and dollar-quoted bodies are
/// copied verbatim.
pub fn map_placeholders(sql: &str, mut visit: impl FnMut(Placeholder<'_>) -> String) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = find_closing_quote(&chars, i + 1, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = (i..chars.len())
                    .find(|&j| chars[j] == '\n')
                    .map(|j| j + 1)
                    .unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = (i + 2..chars.len().saturating_sub(1))
                    .find(|&j| chars[j] == '*' && chars[j + 1] == '/')
                    .map(|j| j + 2)
                    .unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '?' => {
                out.push_str(&visit(Placeholder::Positional));
                i += 1;
            }
            '$' => {
                let ident_end = (i + 1..chars.len())
                    .find(|&j| !(chars[j].is_ascii_alphanumeric() || chars[j] == '_'))
                    .unwrap_or(chars.len());
                let starts_ident = chars
                    .get(i + 1)
                    .is_some_and(|ch| ch.is_ascii_alphabetic() || *ch == '_');

                if chars.get(ident_end) == Some(&'$') && (starts_ident || ident_end == i + 1) {
                    // Dollar-quoted body: $tag$ ... $tag$
                    let tag: String = chars[i..=ident_end].iter().collect();
                    let body_start = ident_end + 1;
                    let rest: String = chars[body_start..].iter().collect();
                    let end = rest
                        .find(&tag)
                        .map(|n| body_start + rest[..n].chars().count() + tag.chars().count())
                        .unwrap_or(chars.len());
                    out.extend(&chars[i..end]);
                    i = end;
                } else if starts_ident {
                    let name: String = chars[i + 1..ident_end].iter().collect();
                    out.push_str(&visit(Placeholder::Named(&name)));
                    i = ident_end;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Index just past the closing quote (doubled quotes are escapes).
fn find_closing_quote(chars: &[char], mut i: usize, quote: char) -> usize {
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Classifies normalized text as schema or data.
///
/// Mixing schema and data statements in one query is rejected.
fn classify_statements(sql: &str) -> Result<QueryKind> {
    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) if !statements.is_empty() => statements,
        _ => return Ok(classify_by_keyword(sql)),
    };

    let mut kinds = statements.iter().map(classify_statement);
    let first = kinds.next().unwrap_or(QueryKind::Data);
    if kinds.any(|k| (k == QueryKind::Scheme) != (first == QueryKind::Scheme)) {
        return Err(TxGuardError::fatal(
            "Schema and data statements cannot be mixed in one query",
        ));
    }
    Ok(first)
}

fn classify_statement(statement: &Statement) -> QueryKind {
    match statement {
        Statement::Explain { .. } => QueryKind::Explain,
        Statement::Drop { .. }
        | Statement::Truncate { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. }
        | Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateRole { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. }
        | Statement::Grant { .. }
        | Statement::Revoke { .. } => QueryKind::Scheme,
        _ => QueryKind::Data,
    }
}

fn classify_by_keyword(sql: &str) -> QueryKind {
    let keyword = leading_keyword(sql)
        .map(|(start, end)| sql[start..end].to_uppercase())
        .unwrap_or_default();
    match keyword.as_str() {
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "GRANT" | "REVOKE" => QueryKind::Scheme,
        "EXPLAIN" => QueryKind::Explain,
        _ => QueryKind::Data,
    }
}
