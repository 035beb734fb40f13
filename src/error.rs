
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::registry::EntityTypeStatus;

/// Per-property validation failures collected by a single `set_data` call,
/// keyed by property key in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(BTreeMap<String, String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }
    pub fn add(&mut self, key: &str, message: impl Into<String>) {
        self.0.entry(key.to_owned()).or_insert_with(|| message.into());
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid identifier: '{0}'")]
    InvalidIdentifier(String),
    #[error("Invalid operator: '{0}'")]
    InvalidOperator(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unknown entity type: '{0}'")]
    UnknownEntityType(String),
    #[error("The entity does not exist: {entity_type} #{id}")]
    NotFound { entity_type: String, id: i64 },
    #[error("Validation failed: {0}")]
    ValidationFailed(ValidationErrors),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Unsupported property type '{property_type}' for {entity_type}.{property}")]
    UnsupportedPropertyType { entity_type: String, property: String, property_type: String },
    #[error("Cannot {operation} entity type '{entity_type}' while it is {status}")]
    InvalidTransition { entity_type: String, status: EntityTypeStatus, operation: &'static str },
    #[error("Invalid entity state: {0}")]
    InvalidState(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, EntityError>;

// Helper conversions
impl From<rusqlite::Error> for EntityError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<serde_json::Error> for EntityError {
    fn from(e: serde_json::Error) -> Self { Self::Persistence(format!("json: {e}")) }
}
impl From<::config::ConfigError> for EntityError {
    fn from(e: ::config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for EntityError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
