//! Rendering of statement results for the CLI.

use base64::Engine;
use serde_json::{json, Value as JsonValue};
use txguard::service::{QueryResult, Value};

/// Renders a result as text: a table for rows, a count otherwise.
pub fn render_text(result: &QueryResult) -> String {
    if result.columns.is_empty() {
        return format!(
            "{} row(s) affected ({:?})",
            result.rows_affected, result.execution_time
        );
    }

    let headers: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(Value::to_display_string).collect())
        .collect();

    format!(
        "{}\n({} row(s), {:?})",
        format_table(&headers, &rows),
        result.row_count(),
        result.execution_time
    )
}

/// Renders a result as one JSON object.
pub fn render_json(sql: &str, result: &QueryResult) -> JsonValue {
    let columns: Vec<JsonValue> = result
        .columns
        .iter()
        .map(|c| json!({ "name": c.name, "type": c.data_type }))
        .collect();
    let rows: Vec<JsonValue> = result
        .rows
        .iter()
        .map(|row| JsonValue::Array(row.iter().map(value_to_json).collect()))
        .collect();

    json!({
        "statement": sql,
        "columns": columns,
        "rows": rows,
        "rows_affected": result.rows_affected,
        "execution_time_ms": result.execution_time.as_secs_f64() * 1000.0,
    })
}

/// Converts a value to JSON. Bytes are base64 and timestamps RFC 3339.
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Bytes(b) => JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b)),
        Value::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
    }
}

/// Formats a table as a string for display.
fn format_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let pad = |cells: &[String]| -> String {
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let width = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = width)
            })
            .collect::<Vec<_>>()
            .join(" │ ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![pad(headers)];
    lines.push(
        widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("─┼─"),
    );
    lines.extend(rows.iter().map(|row| pad(row)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use txguard::service::ColumnInfo;

    #[test]
    fn test_render_table() {
        let result = QueryResult::with_data(
            vec![ColumnInfo::new("name", "text"), ColumnInfo::new("age", "int8")],
            vec![
                vec![Value::from("Alice"), Value::Int(30)],
                vec![Value::from("Bob"), Value::Null],
            ],
        );

        let text = render_text(&result);
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("name  │ age"));
        assert_eq!(lines.next(), Some("──────┼─────"));
        assert_eq!(lines.next(), Some("Alice │ 30"));
        assert!(text.contains("(2 row(s)"));
    }

    #[test]
    fn test_render_affected() {
        let text = render_text(&QueryResult::affected(3));
        assert!(text.starts_with("3 row(s) affected"));
    }

    #[test]
    fn test_value_to_json() {
        assert_eq!(value_to_json(&Value::Bytes(b"hi".to_vec())), json!("aGk="));
        assert_eq!(value_to_json(&Value::Null), JsonValue::Null);
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            value_to_json(&Value::Timestamp(ts)),
            json!("2024-01-02T03:04:05+00:00")
        );
    }

    #[test]
    fn test_render_json_shape() {
        let result = QueryResult::with_data(
            vec![ColumnInfo::new("id", "int8")],
            vec![vec![Value::Int(1)]],
        );
        let doc = render_json("SELECT id FROM t", &result);
        assert_eq!(doc["statement"], json!("SELECT id FROM t"));
        assert_eq!(doc["columns"][0]["name"], json!("id"));
        assert_eq!(doc["rows"], json!([[1]]));
    }
}
