// used for persistence
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};

// used for timestamps presented to people
use chrono::{DateTime, NaiveDate, Utc};

// used for JSON
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// used when parsing a property type from its declared name
use std::str::FromStr;
// used to print out readable forms of a value
use std::fmt;

// ------------- Property Types --------------
/// The fixed enumeration of property types a declaration may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Text,
    LongText,
    Email,
    Integer,
    Date,
    Boolean,
    Price,
    User,
    Project,
    Record,
    EntityReference,
    Json,
}

pub const ALL_PROPERTY_TYPES: [PropertyType; 12] = [
    PropertyType::Text,
    PropertyType::LongText,
    PropertyType::Email,
    PropertyType::Integer,
    PropertyType::Date,
    PropertyType::Boolean,
    PropertyType::Price,
    PropertyType::User,
    PropertyType::Project,
    PropertyType::Record,
    PropertyType::EntityReference,
    PropertyType::Json,
];

impl PropertyType {
    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::Text => "text",
            PropertyType::LongText => "long_text",
            PropertyType::Email => "email",
            PropertyType::Integer => "integer",
            PropertyType::Date => "date",
            PropertyType::Boolean => "boolean",
            PropertyType::Price => "price",
            PropertyType::User => "user",
            PropertyType::Project => "project",
            PropertyType::Record => "record",
            PropertyType::EntityReference => "entity_reference",
            PropertyType::Json => "json",
        }
    }
    /// Column type used when provisioning the backing table.
    pub fn column_type(&self) -> &'static str {
        match self {
            PropertyType::Text | PropertyType::Email | PropertyType::User | PropertyType::Record => {
                "VARCHAR(255)"
            }
            PropertyType::LongText | PropertyType::Json => "TEXT",
            PropertyType::Integer | PropertyType::Date => "INT",
            PropertyType::Boolean => "TINYINT",
            PropertyType::Price | PropertyType::Project | PropertyType::EntityReference => "INT UNSIGNED",
        }
    }
    /// The storage class values of this type take in memory.
    pub fn storage(&self) -> Storage {
        match self {
            PropertyType::Text
            | PropertyType::LongText
            | PropertyType::Email
            | PropertyType::User
            | PropertyType::Record => Storage::Text,
            PropertyType::Integer
            | PropertyType::Date
            | PropertyType::Price
            | PropertyType::Project
            | PropertyType::EntityReference => Storage::Integer,
            PropertyType::Boolean => Storage::Boolean,
            PropertyType::Json => Storage::Json,
        }
    }
}
impl FromStr for PropertyType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        ALL_PROPERTY_TYPES
            .iter()
            .find(|t| t.name() == lowered)
            .copied()
            .ok_or_else(|| s.to_owned())
    }
}
impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Text,
    Integer,
    Boolean,
    Json,
}

// ------------- Values --------------
/// A typed property value. Which variant a property holds is decided by
/// the storage class of its declared type; `Json` keeps serialized text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Boolean(bool),
    Json(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Json(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
    /// Rebuilds a value read from a column, given the storage class it belongs to.
    pub fn from_sql(storage: Storage, value: ValueRef<'_>) -> Value {
        match (storage, value) {
            (_, ValueRef::Null) => Value::Null,
            (Storage::Integer, ValueRef::Integer(i)) => Value::Integer(i),
            (Storage::Integer, ValueRef::Real(r)) => Value::Integer(r as i64),
            (Storage::Integer, ValueRef::Text(t)) => std::str::from_utf8(t)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Value::Integer)
                .unwrap_or(Value::Null),
            (Storage::Boolean, ValueRef::Integer(i)) => Value::Boolean(i != 0),
            (Storage::Boolean, ValueRef::Text(t)) => Value::Boolean(t != b"0" && !t.is_empty()),
            (Storage::Json, ValueRef::Text(t)) => Value::Json(String::from_utf8_lossy(t).into_owned()),
            (Storage::Text, ValueRef::Text(t)) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            (Storage::Text, ValueRef::Integer(i)) => Value::Text(i.to_string()),
            (_, other) => match SqlValue::from(other) {
                SqlValue::Integer(i) => Value::Integer(i),
                SqlValue::Real(r) => Value::Text(r.to_string()),
                SqlValue::Text(s) => Value::Text(s),
                SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
                SqlValue::Null => Value::Null,
            },
        }
    }
    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            Value::Null => SqlValue::Null,
            Value::Text(s) | Value::Json(s) => SqlValue::Text(s.clone()),
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        }
    }
    /// JSON rendering for consumers. With `decode`, serialized JSON is
    /// parsed back into structured form.
    pub fn to_json(&self, decode: bool) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Json(s) if decode => {
                serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone()))
            }
            Value::Json(s) => JsonValue::String(s.clone()),
        }
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Text(s) | Value::Json(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Boolean(b) => write!(f, "{}", if *b { 1 } else { 0 }),
        }
    }
}
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Text(s) | Value::Json(s) => ToSqlOutput::from(s.as_str()),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Boolean(b) => ToSqlOutput::from(i64::from(*b)),
        })
    }
}

// ------------- Presentation --------------
/// Converts a decimal amount such as "12.50" or "$1,200" into integral cents.
pub fn parse_price(input: &str) -> Option<i64> {
    let cleaned: String = input
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('-') {
        return None;
    }
    let (whole, fraction) = match cleaned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (cleaned.as_str(), ""),
    };
    if fraction.len() > 2
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let cents: i64 = format!("{:0<2}", fraction).parse().ok()?;
    whole.checked_mul(100)?.checked_add(cents)
}

pub fn format_price(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}${}.{:02}", sign, grouped, cents % 100)
}

/// Parses a `mm/dd/YYYY` date into a unix timestamp at midnight UTC.
pub fn parse_date(input: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(input.trim(), "%m/%d/%Y").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

pub fn format_date(timestamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(|d| d.format("%m/%d/%Y").to_string())
}
