//! One row of an entity type's table as an addressable object with typed,
//! validated properties.
//!
//! An entity is bound to its registry and to the type info it was created
//! with. Its data always holds exactly the declared property keys.
//!
//! ```text
//! New --save--> Loaded --set_data--> Modified --save--> Loaded
//!                  \--delete--> Deleted --save--> Loaded (new id)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use crate::datatype::{format_date, format_price, PropertyType, Storage, Value};
use crate::declaration::PropertyDeclaration;
use crate::error::{EntityError, Result, ValidationErrors};
use crate::persist::{EventType, LogEntry, SqlRow};
use crate::registry::{EntityRegistry, EntityTypeInfo};

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    New,
    Loaded,
    /// Loaded, with changes not saved yet.
    Modified,
    Deleted,
}

pub struct Entity<'r> {
    registry: &'r EntityRegistry,
    info: Arc<EntityTypeInfo>,
    id: Option<i64>,
    created: Option<i64>,
    updated: Option<i64>,
    data: BTreeMap<String, Value>,
    old_data: Option<BTreeMap<String, Value>>,
    errors: Option<ValidationErrors>,
    deleted: bool,
}

impl fmt::Debug for Entity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Entity")
            .field("entity_type", &self.info.key())
            .field("id", &self.id)
            .field("state", &self.state())
            .field("data", &self.data)
            .finish()
    }
}

/// Storage class of a declared property; several references are one JSON array.
fn storage_of(property: &PropertyDeclaration) -> Storage {
    if property.multiple {
        return Storage::Json;
    }
    property.property_type().map(|t| t.storage()).unwrap_or(Storage::Text)
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Blank for this property: null, an empty string, or an empty id list
/// for a multiple reference.
fn is_blank_for(property: &PropertyDeclaration, value: &JsonValue) -> bool {
    is_blank(value) || (property.multiple && as_id_list(value).is_some_and(|ids| ids.is_empty()))
}

/// Integral numbers and numeric strings such as "12" or "12.0".
fn as_integral(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.2e18).map(|f| f as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < 9.2e18)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_flag(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        other => match as_integral(other) {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
    }
}

/// References given as one id or a list of ids.
fn as_id_list(value: &JsonValue) -> Option<Vec<i64>> {
    match value {
        JsonValue::Array(items) => items.iter().map(as_integral).collect(),
        JsonValue::String(s) if s.trim_start().starts_with('[') => {
            serde_json::from_str::<JsonValue>(s).ok().as_ref().and_then(as_id_list)
        }
        other => as_integral(other).map(|id| vec![id]),
    }
}

/// The key a value is looked up by in a choices map.
fn choice_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_owned()),
        other => as_text(other),
    }
}

/// Converts an already validated input value into its stored form.
fn coerce(property: &PropertyDeclaration, value: &JsonValue) -> Value {
    if is_blank_for(property, value) {
        return Value::Null;
    }
    if property.multiple {
        let ids = as_id_list(value).unwrap_or_default();
        return Value::Json(JsonValue::from(ids).to_string());
    }
    match storage_of(property) {
        Storage::Text => as_text(value).map(Value::Text).unwrap_or(Value::Null),
        Storage::Integer => as_integral(value).map(Value::Integer).unwrap_or(Value::Null),
        Storage::Boolean => as_flag(value).map(Value::Boolean).unwrap_or(Value::Null),
        Storage::Json => match value {
            JsonValue::String(s) if serde_json::from_str::<JsonValue>(s).is_ok() => Value::Json(s.clone()),
            other => Value::Json(other.to_string()),
        },
    }
}

fn defaults(info: &EntityTypeInfo) -> BTreeMap<String, Value> {
    info.declaration
        .properties
        .iter()
        .map(|p| {
            let value = p.default.as_ref().map(|d| coerce(p, d)).unwrap_or_default();
            (p.key.clone(), value)
        })
        .collect()
}

impl<'r> Entity<'r> {
    /// A new, unsaved entity holding the declared defaults.
    pub fn new(registry: &'r EntityRegistry, info: Arc<EntityTypeInfo>) -> Self {
        let data = defaults(&info);
        Self {
            registry,
            info,
            id: None,
            created: None,
            updated: None,
            data,
            old_data: None,
            errors: None,
            deleted: false,
        }
    }

    /// Reads one row; `NotFound` when there is none.
    pub fn load(registry: &'r EntityRegistry, info: Arc<EntityTypeInfo>, id: i64) -> Result<Self> {
        let table = info.table_name()?;
        let row = registry.persistor()?.load_row(&table, id)?;
        match row {
            Some(row) => Self::from_row(registry, info, &row),
            None => Err(EntityError::NotFound {
                entity_type: info.key().to_owned(),
                id,
            }),
        }
    }

    /// Hydrates from a row carrying the base columns and the property columns.
    pub fn from_row(registry: &'r EntityRegistry, info: Arc<EntityTypeInfo>, row: &SqlRow) -> Result<Self> {
        let id = row.get_i64("id").ok_or_else(|| {
            EntityError::Persistence(format!("row of {} has no id", info.key()))
        })?;
        let mut entity = Self::new(registry, info);
        for property in &entity.info.declaration.properties {
            let value = match row.get(&property.key) {
                Some(sql) => Value::from_sql(storage_of(property), ValueRef::from(sql)),
                None => Value::Null,
            };
            entity.data.insert(property.key.clone(), value);
        }
        entity.id = Some(id);
        entity.created = row.get_i64("created");
        entity.updated = row.get_i64("updated");
        entity.old_data = Some(entity.data.clone());
        Ok(entity)
    }

    // ------------- Accessors -------------
    pub fn id(&self) -> Option<i64> {
        self.id
    }
    pub fn created(&self) -> Option<i64> {
        self.created
    }
    pub fn updated(&self) -> Option<i64> {
        self.updated
    }
    pub fn entity_type(&self) -> &str {
        self.info.key()
    }
    pub fn info(&self) -> &Arc<EntityTypeInfo> {
        &self.info
    }
    pub fn registry(&self) -> &'r EntityRegistry {
        self.registry
    }
    /// The failures of the last `set_data`, if it was called.
    pub fn errors(&self) -> Option<&ValidationErrors> {
        self.errors.as_ref()
    }
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.data
    }
    pub fn state(&self) -> EntityState {
        match (&self.id, &self.old_data) {
            _ if self.deleted => EntityState::Deleted,
            (None, _) => EntityState::New,
            (Some(_), Some(old)) if *old != self.data => EntityState::Modified,
            (Some(_), _) => EntityState::Loaded,
        }
    }

    /// Every declared property; JSON properties and reference lists are decoded.
    pub fn get_data(&self) -> JsonMap<String, JsonValue> {
        self.data
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json(true)))
            .collect()
    }

    /// `#<id>`, or the label property's value if the type declares one.
    /// `None` before the first save.
    pub fn get_label(&self) -> Option<String> {
        let id = self.id?;
        match &self.info.declaration.special_keys.label {
            None => Some(format!("#{id}")),
            Some(key) => self.data.get(key).filter(|v| !v.is_null()).map(|v| v.to_string()),
        }
    }

    // ------------- Validation -------------
    /// Validates every supplied key and, if all pass, assigns them.
    /// On failure nothing is assigned and the failures are kept in
    /// [`Entity::errors`] as well as returned.
    pub fn set_data(&mut self, data: JsonValue) -> Result<()> {
        let data = match data {
            JsonValue::Object(map) => map,
            other => {
                return Err(EntityError::InvalidArgument(format!(
                    "entity data must be an object, got {other}"
                )))
            }
        };
        let mut errors = ValidationErrors::new();
        for (key, value) in &data {
            if let Some(message) = self.validate_property(key, value)? {
                errors.add(key, message);
            }
        }
        if !errors.is_empty() {
            debug!(entity_type = %self.info.key(), %errors, "rejected data");
            self.errors = Some(errors.clone());
            return Err(EntityError::ValidationFailed(errors));
        }
        for (key, value) in &data {
            if let Some(property) = self.info.declaration.property_decl(key) {
                let coerced = coerce(property, value);
                self.data.insert(key.clone(), coerced);
            }
        }
        self.errors = Some(errors);
        Ok(())
    }

    /// `Some(message)` when the value is not acceptable for the property.
    fn validate_property(&self, key: &str, value: &JsonValue) -> Result<Option<String>> {
        let property = match self.info.declaration.property_decl(key) {
            Some(property) => property,
            None => return Ok(Some("Unknown property".to_owned())),
        };
        if is_blank_for(property, value) {
            return Ok(property.required.then(|| format!("{} is required", property.label())));
        }
        let property_type = match property.property_type() {
            Some(t) => t,
            None => return Ok(Some(format!("Unsupported type '{}'", property.type_name))),
        };
        let context = self.registry.context();
        let invalid = match property_type {
            PropertyType::Text | PropertyType::LongText => (!value.is_string()).then(|| "Must be text".to_owned()),
            PropertyType::Email => match value.as_str() {
                Some(s) if EMAIL.is_match(s) => None,
                _ => Some("Must be a valid email address".to_owned()),
            },
            PropertyType::Integer | PropertyType::Date => {
                as_integral(value).is_none().then(|| "Must be an integer".to_owned())
            }
            PropertyType::Boolean => as_flag(value).is_none().then(|| "Must be a boolean".to_owned()),
            PropertyType::Price => match as_integral(value) {
                Some(cents) if cents >= 0 => None,
                _ => Some("Must be a non-negative amount in cents".to_owned()),
            },
            PropertyType::User => match as_text(value) {
                Some(user) if context.username_exists(&user) => None,
                _ => Some("User does not exist".to_owned()),
            },
            PropertyType::Project => match as_integral(value) {
                Some(project) if context.project_exists(project) => match context.user_id() {
                    None => None,
                    Some(user) if context.is_super_user() || context.has_privilege(project, &user) => None,
                    Some(_) => Some("You are not allowed to use this project".to_owned()),
                },
                _ => Some("Project does not exist".to_owned()),
            },
            PropertyType::Record => match (context.project_id(), as_text(value)) {
                (Some(project), Some(record)) if context.record_exists(project, &record) => None,
                (None, _) => Some("Records can only be referenced within a project".to_owned()),
                _ => Some("Record does not exist".to_owned()),
            },
            PropertyType::EntityReference => self.validate_reference(property, value)?,
            PropertyType::Json => None,
        };
        if invalid.is_some() {
            return Ok(invalid);
        }

        if let Some(choices) = &property.choices {
            if !choice_key(value).is_some_and(|k| choices.contains_key(&k)) {
                return Ok(Some("Invalid choice".to_owned()));
            }
        }
        if let Some(callback) = &property.choices_callback {
            let choices = self.info.kind.hooks().and_then(|hooks| hooks.resolve_choices(callback));
            match choices {
                None => return Ok(Some(format!("Choices from '{callback}' are not available"))),
                Some(choices) if !choice_key(value).is_some_and(|k| choices.contains_key(&k)) => {
                    return Ok(Some("Invalid choice".to_owned()))
                }
                Some(_) => {}
            }
        }
        Ok(self.info.kind.hooks().and_then(|hooks| hooks.validate_property(key, value)))
    }

    fn validate_reference(&self, property: &PropertyDeclaration, value: &JsonValue) -> Result<Option<String>> {
        let target = match &property.entity_type {
            Some(target) => target,
            None => return Ok(Some("No referenced entity type".to_owned())),
        };
        let ids = if property.multiple {
            as_id_list(value)
        } else {
            as_integral(value).map(|id| vec![id])
        };
        let ids = match ids {
            Some(ids) => ids,
            None => return Ok(Some("Must reference an entity id".to_owned())),
        };
        for id in ids {
            if self.registry.get_instance(target, Some(id))?.is_none() {
                return Ok(Some(format!("The referenced {target} #{id} does not exist")));
            }
        }
        Ok(None)
    }

    // ------------- Persistence -------------
    /// Validates then inserts. Only for entities that were never saved.
    pub fn create(&mut self, data: JsonValue) -> Result<i64> {
        if self.id.is_some() {
            return Err(EntityError::InvalidState(format!(
                "{} #{} is already stored",
                self.info.key(),
                self.id.unwrap_or_default()
            )));
        }
        self.set_data(data)?;
        self.save()
    }

    /// Inserts a new entity, or writes the properties that changed since
    /// the last load or save. Requires a successful `set_data` first.
    /// Returns the id.
    pub fn save(&mut self) -> Result<i64> {
        match &self.errors {
            Some(errors) if errors.is_empty() => {}
            Some(errors) => return Err(EntityError::ValidationFailed(errors.clone())),
            None => {
                return Err(EntityError::InvalidState(
                    "save requires a successful set_data first".to_owned(),
                ))
            }
        }
        let table = self.info.table_name()?;
        let context = self.registry.context();

        let (id, event) = match self.id {
            Some(id) => {
                let old = self.old_data.as_ref();
                let changed: Vec<(&str, SqlValue)> = self
                    .data
                    .iter()
                    .filter(|(key, value)| old.and_then(|o| o.get(*key)) != Some(*value))
                    .map(|(key, value)| (key.as_str(), value.to_sql_value()))
                    .collect();
                if changed.is_empty() {
                    debug!(entity_type = %self.info.key(), id, "nothing changed");
                    return Ok(id);
                }
                let now = context.now();
                let mut row = changed;
                row.push(("updated", SqlValue::Integer(now)));
                let written = self.registry.persistor()?.update_row(&table, id, &row)?;
                if written == 0 {
                    return Err(EntityError::NotFound {
                        entity_type: self.info.key().to_owned(),
                        id,
                    });
                }
                self.updated = Some(now);
                (id, EventType::Update)
            }
            None => {
                let special = &self.info.declaration.special_keys;
                if let (Some(key), Some(user)) = (&special.author, context.user_id()) {
                    if self.data.get(key).is_none_or(Value::is_null) {
                        self.data.insert(key.clone(), Value::Text(user));
                    }
                }
                if let (Some(key), Some(project)) = (&special.project, context.project_id()) {
                    if self.data.get(key).is_none_or(Value::is_null) {
                        self.data.insert(key.clone(), Value::Integer(project));
                    }
                }
                let mut missing = ValidationErrors::new();
                for property in self.info.declaration.properties.iter().filter(|p| p.required) {
                    if self.data.get(&property.key).is_none_or(Value::is_null) {
                        missing.add(&property.key, format!("{} is required", property.label()));
                    }
                }
                if !missing.is_empty() {
                    debug!(entity_type = %self.info.key(), errors = %missing, "required properties missing");
                    self.errors = Some(missing.clone());
                    return Err(EntityError::ValidationFailed(missing));
                }
                let now = context.now();
                let mut row: Vec<(&str, SqlValue)> =
                    vec![("created", SqlValue::Integer(now)), ("updated", SqlValue::Integer(now))];
                row.extend(self.data.iter().map(|(key, value)| (key.as_str(), value.to_sql_value())));
                let id = self.registry.persistor()?.insert_row(&table, &row)?;
                self.id = Some(id);
                self.created = Some(now);
                self.updated = Some(now);
                (id, EventType::Create)
            }
        };
        self.old_data = Some(self.data.clone());
        self.deleted = false;
        self.log_event(event);
        Ok(id)
    }

    /// Removes the row and resets this instance to an unsaved entity.
    pub fn delete(&mut self) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            EntityError::InvalidState(format!("{} has not been saved", self.info.key()))
        })?;
        let table = self.info.table_name()?;
        self.registry.persistor()?.delete_row(&table, id)?;
        self.log_event(EventType::Delete);
        self.id = None;
        self.created = None;
        self.updated = None;
        self.errors = None;
        self.old_data = None;
        self.data = defaults(&self.info);
        self.deleted = true;
        Ok(())
    }

    /// Appends to the audit trail if the entity class asks for this event.
    /// Failures are logged and otherwise ignored.
    fn log_event(&self, event: EventType) {
        let hooks = match self.info.kind.hooks() {
            Some(hooks) if hooks.loggable_events().contains(&event) => hooks,
            _ => return,
        };
        let id = match self.id {
            Some(id) => id,
            None => return,
        };
        let entry = LogEntry {
            entity_id: id,
            entity_type: self.info.key().to_owned(),
            event_type: event,
            user_id: self.registry.context().user_id(),
            time: self.registry.context().now(),
            data: JsonValue::Object(self.get_data()),
            message: hooks.log_message(event, self),
        };
        let logged = self
            .registry
            .persistor()
            .and_then(|mut persistor| persistor.append_log(&entry));
        if let Err(e) = logged {
            warn!(entity_type = %entry.entity_type, id, %event, error = %e, "audit log entry not written");
        }
    }

    // ------------- Presentation -------------
    /// The value of one property as people read it. `None` for undeclared keys.
    pub fn display_value(&self, key: &str) -> Result<Option<String>> {
        let (property, value) = match (self.info.declaration.property_decl(key), self.data.get(key)) {
            (Some(property), Some(value)) => (property, value),
            _ => return Ok(None),
        };
        if value.is_null() {
            return Ok(Some(String::new()));
        }
        let raw = value.to_string();
        let choices = match (&property.choices, &property.choices_callback) {
            (Some(choices), _) => Some(choices.clone()),
            (None, Some(callback)) => self.info.kind.hooks().and_then(|h| h.resolve_choices(callback)),
            _ => None,
        };
        if let Some(label) = choices.and_then(|c| c.get(&raw).cloned()) {
            return Ok(Some(label));
        }
        let shown = match property.property_type() {
            Some(PropertyType::Price) => value.as_i64().map(format_price).unwrap_or(raw),
            Some(PropertyType::Date) => value.as_i64().and_then(format_date).unwrap_or(raw),
            Some(PropertyType::Boolean) => match value.as_bool() {
                Some(true) => "Yes".to_owned(),
                _ => "No".to_owned(),
            },
            Some(PropertyType::EntityReference) => {
                let target = property.entity_type.as_deref().unwrap_or_default();
                let ids = match value {
                    Value::Integer(id) => vec![*id],
                    other => as_id_list(&other.to_json(true)).unwrap_or_default(),
                };
                let mut labels = Vec::with_capacity(ids.len());
                for id in ids {
                    let label = self
                        .registry
                        .get_instance(target, Some(id))?
                        .and_then(|e| e.get_label())
                        .unwrap_or_else(|| format!("#{id}"));
                    labels.push(label);
                }
                labels.join(", ")
            }
            _ => raw,
        };
        Ok(Some(shown))
    }
}
