// used for persistence
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

// used for the audit trail payload
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EntityError, Result};
use crate::sanitize::{quote_identifier, render_statement, LOG_TABLE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

impl PersistenceMode {
    /// `:memory:` selects an in-memory database, anything else is a file path.
    pub fn from_setting(database: &str) -> Self {
        if database == ":memory:" {
            PersistenceMode::InMemory
        } else {
            PersistenceMode::File(database.to_owned())
        }
    }
}

/// Counts of statements issued, by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteStatistics {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub ddl: u64,
}

// ------------- Rows -------------
/// One result row with its column names.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}
impl SqlRow {
    /// First column with that name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(SqlValue::Integer(i)) => Some(*i),
            Some(SqlValue::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
    pub fn to_json(&self) -> JsonMap<String, JsonValue> {
        let mut map = JsonMap::new();
        for (column, value) in self.columns.iter().zip(self.values.iter()) {
            if map.contains_key(column) {
                continue;
            }
            let json = match value {
                SqlValue::Null => JsonValue::Null,
                SqlValue::Integer(i) => JsonValue::from(*i),
                SqlValue::Real(r) => JsonValue::from(*r),
                SqlValue::Text(s) => JsonValue::String(s.clone()),
                SqlValue::Blob(b) => JsonValue::from(b.clone()),
            };
            map.insert(column.clone(), json);
        }
        map
    }
}

// ------------- Audit log -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Create,
    Update,
    Delete,
}
impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}
impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
impl FromStr for EventType {
    type Err = EntityError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(EventType::Create),
            "update" => Ok(EventType::Update),
            "delete" => Ok(EventType::Delete),
            other => Err(EntityError::InvalidArgument(format!("unknown event type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entity_id: i64,
    pub entity_type: String,
    pub event_type: EventType,
    pub user_id: Option<String>,
    pub time: i64,
    pub data: JsonValue,
    pub message: Option<String>,
}

// ------------- Persistence -------------
pub struct Persistor {
    db: Connection,
    statistics: WriteStatistics,
}
impl Persistor {
    pub fn new(mode: PersistenceMode) -> Result<Persistor> {
        let db = match &mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        db.execute_batch(&format!(
            "
            create table if not exists {LOG_TABLE} (
                id integer not null primary key autoincrement,
                entity_id integer not null,
                entity_type text not null,
                event_type text not null,
                user_id text null,
                time integer not null,
                data text not null,
                message text null
            );
            create index if not exists {LOG_TABLE}_entity on {LOG_TABLE} (
                entity_type,
                entity_id
            );
            "
        ))?;
        debug!(?mode, "persistor ready");
        Ok(Persistor {
            db,
            statistics: WriteStatistics::default(),
        })
    }
    pub fn statistics(&self) -> WriteStatistics {
        self.statistics
    }
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .query_row(
                "select 1 from sqlite_master where type = 'table' and name = ?",
                params![table],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
    pub fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "ddl");
        self.db.execute_batch(sql)?;
        self.statistics.ddl += 1;
        Ok(())
    }
    /// Inserts one row and returns the id the table assigned.
    pub fn insert_row(&mut self, table: &str, row: &[(&str, SqlValue)]) -> Result<i64> {
        let mut columns = Vec::with_capacity(row.len());
        for (column, _) in row {
            columns.push(quote_identifier(column)?);
        }
        let placeholders = vec!["?"; row.len()].join(", ");
        let sql = format!(
            "insert into {} ({}) values ({})",
            quote_identifier(table)?,
            columns.join(", "),
            placeholders
        );
        let values: Vec<&SqlValue> = row.iter().map(|(_, v)| v).collect();
        self.trace(&sql, row.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>().as_slice());
        self.db.execute(&sql, params_from_iter(values))?;
        self.statistics.inserts += 1;
        Ok(self.db.last_insert_rowid())
    }
    pub fn update_row(&mut self, table: &str, id: i64, row: &[(&str, SqlValue)]) -> Result<usize> {
        let mut assignments = Vec::with_capacity(row.len());
        for (column, _) in row {
            assignments.push(format!("{} = ?", quote_identifier(column)?));
        }
        let sql = format!(
            "update {} set {} where \"id\" = ?",
            quote_identifier(table)?,
            assignments.join(", ")
        );
        let mut values: Vec<SqlValue> = row.iter().map(|(_, v)| v.clone()).collect();
        values.push(SqlValue::Integer(id));
        self.trace(&sql, &values);
        let changed = self.db.execute(&sql, params_from_iter(values.iter()))?;
        self.statistics.updates += 1;
        Ok(changed)
    }
    pub fn delete_row(&mut self, table: &str, id: i64) -> Result<usize> {
        let sql = format!("delete from {} where \"id\" = ?", quote_identifier(table)?);
        self.trace(&sql, &[SqlValue::Integer(id)]);
        let changed = self.db.execute(&sql, params![id])?;
        self.statistics.deletes += 1;
        Ok(changed)
    }
    pub fn load_row(&self, table: &str, id: i64) -> Result<Option<SqlRow>> {
        let sql = format!("select * from {} where \"id\" = ?", quote_identifier(table)?);
        Ok(self.select(&sql, &[SqlValue::Integer(id)])?.into_iter().next())
    }
    pub fn select(&self, sql: &str, parameters: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.trace(sql, parameters);
        let mut statement = self.db.prepare_cached(sql)?;
        let columns: Arc<Vec<String>> =
            Arc::new(statement.column_names().into_iter().map(String::from).collect());
        let count = columns.len();
        let mut rows = statement.query(params_from_iter(parameters.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(count);
            for i in 0..count {
                values.push(row.get::<_, SqlValue>(i)?);
            }
            result.push(SqlRow {
                columns: Arc::clone(&columns),
                values,
            });
        }
        Ok(result)
    }
    pub fn select_scalar(&self, sql: &str, parameters: &[SqlValue]) -> Result<i64> {
        self.trace(sql, parameters);
        let value: Option<i64> = self
            .db
            .query_row(sql, params_from_iter(parameters.iter()), |r| r.get(0))?;
        Ok(value.unwrap_or(0))
    }
    pub fn append_log(&mut self, entry: &LogEntry) -> Result<i64> {
        let sql = format!(
            "insert into {LOG_TABLE} (
                entity_id,
                entity_type,
                event_type,
                user_id,
                time,
                data,
                message
            ) values (?, ?, ?, ?, ?, ?, ?)"
        );
        self.db.execute(
            &sql,
            params![
                entry.entity_id,
                entry.entity_type,
                entry.event_type.name(),
                entry.user_id,
                entry.time,
                serde_json::to_string(&entry.data)?,
                entry.message
            ],
        )?;
        Ok(self.db.last_insert_rowid())
    }
    pub fn log_entries(&self, entity_type: &str, entity_id: i64) -> Result<Vec<LogEntry>> {
        let sql = format!(
            "select entity_id, entity_type, event_type, user_id, time, data, message
                from {LOG_TABLE}
                where entity_type = ?
                and entity_id = ?
                order by id"
        );
        let mut statement = self.db.prepare_cached(&sql)?;
        let rows = statement.query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (entity_id, entity_type, event_type, user_id, time, data, message) = row?;
            entries.push(LogEntry {
                entity_id,
                entity_type,
                event_type: event_type.parse()?,
                user_id,
                time,
                data: serde_json::from_str(&data)?,
                message,
            });
        }
        Ok(entries)
    }
    fn trace(&self, sql: &str, parameters: &[SqlValue]) {
        debug!(sql = %render_statement(sql, parameters), "statement");
    }
}
