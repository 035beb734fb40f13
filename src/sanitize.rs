//! Identifier and value gate for every piece of SQL the crate composes.
//!
//! Table names, column names, aliases and order-by targets are interpolated
//! into statement text, so they must match `[a-zA-Z0-9_]+` and are then
//! double-quoted. Values never reach statement text: they are bound as
//! parameters through [`to_sql_value`]. [`escape_literal`] renders the same
//! conversion as an escaped SQL literal for diagnostics.

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;

use crate::error::{EntityError, Result};

/// Every entity table is this prefix followed by the sanitized type key.
pub const TABLE_PREFIX: &str = "entity_store_";

/// The shared audit trail table.
pub const LOG_TABLE: &str = "entity_store_log";

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[a-zA-Z0-9_]+$").unwrap();
}

pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

/// Returns the identifier unchanged, or fails with `InvalidIdentifier`.
pub fn sanitize_identifier(s: &str) -> Result<&str> {
    if is_identifier(s) {
        Ok(s)
    } else {
        Err(EntityError::InvalidIdentifier(s.to_owned()))
    }
}

pub fn quote_identifier(s: &str) -> Result<String> {
    Ok(format!("\"{}\"", sanitize_identifier(s)?))
}

/// Quotes `column` or `qualifier.column`, sanitizing each part.
pub fn quote_column_ref(s: &str) -> Result<String> {
    match s.split_once('.') {
        Some((qualifier, column)) => Ok(format!(
            "{}.{}",
            quote_identifier(qualifier).map_err(|_| EntityError::InvalidIdentifier(s.to_owned()))?,
            quote_identifier(column).map_err(|_| EntityError::InvalidIdentifier(s.to_owned()))?
        )),
        None => quote_identifier(s),
    }
}

pub fn table_name(entity_type: &str) -> Result<String> {
    Ok(format!("{}{}", TABLE_PREFIX, sanitize_identifier(entity_type)?))
}

pub fn quoted_table_name(entity_type: &str) -> Result<String> {
    quote_identifier(&table_name(entity_type)?)
}

/// Converts a caller-supplied value into a bindable parameter.
/// Booleans become 1/0, arrays and objects are serialized to JSON text.
pub fn to_sql_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or_else(|| SqlValue::Text(n.to_string())),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Renders a value as an escaped SQL literal. Booleans map to '1'/'0',
/// null to NULL, arrays and objects are JSON-serialized before escaping.
pub fn escape_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_owned(),
        JsonValue::Bool(b) => if *b { "'1'".to_owned() } else { "'0'".to_owned() },
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => quote_text(s),
        JsonValue::Array(_) | JsonValue::Object(_) => quote_text(&value.to_string()),
    }
}

pub fn escape_sql_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_owned(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(r) => r.to_string(),
        SqlValue::Text(s) => quote_text(s),
        SqlValue::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{hex}'")
        }
    }
}

fn quote_text(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Substitutes positional `?` placeholders with escaped literals, for logging.
/// Placeholders inside quoted identifiers or string literals are left alone.
pub fn render_statement(sql: &str, params: &[SqlValue]) -> String {
    let mut rendered = String::with_capacity(sql.len());
    let mut params = params.iter();
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                rendered.push(c);
            }
            (Some(q), _) if q == c => {
                quote = None;
                rendered.push(c);
            }
            (None, '?') => match params.next() {
                Some(p) => rendered.push_str(&escape_sql_value(p)),
                None => rendered.push('?'),
            },
            _ => rendered.push(c),
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literals_are_escaped() {
        assert_eq!(escape_literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(escape_literal(&json!(true)), "'1'");
        assert_eq!(escape_literal(&json!(null)), "NULL");
        assert_eq!(escape_literal(&json!([1, "a"])), "'[1,\"a\"]'");
    }

    #[test]
    fn rendering_skips_quoted_question_marks() {
        let sql = "SELECT \"a?\" FROM t WHERE x = ? AND y = '?' AND z = ?";
        let params = [SqlValue::Integer(3), SqlValue::Text("it's".into())];
        assert_eq!(
            render_statement(sql, &params),
            "SELECT \"a?\" FROM t WHERE x = 3 AND y = '?' AND z = 'it''s'"
        );
    }

    #[test]
    fn column_refs_are_quoted_per_part() {
        assert_eq!(quote_column_ref("e.updated").unwrap(), "\"e\".\"updated\"");
        assert!(quote_column_ref("e.up dated").is_err());
        assert!(quote_column_ref("a.b.c").is_err());
    }
}
