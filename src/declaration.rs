//! Entity-type declarations as authored by modules.
//!
//! A declaration is immutable once loaded; the registry wraps it together
//! with its derived status. Declarations can be built in code with the
//! builder methods below or deserialized from JSON (see
//! [`crate::module::DeclarativeModule`]).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::datatype::PropertyType;

/// Columns every entity table carries in addition to its declared properties.
pub const BASE_COLUMNS: [&str; 3] = ["id", "created", "updated"];

pub const MAX_KEY_LENGTH: usize = 50;

// ------------- Property -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDeclaration {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Type name exactly as declared; checked against [`PropertyType`] by the registry.
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices_callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
}

impl PropertyDeclaration {
    pub fn new(key: &str, property_type: PropertyType) -> Self {
        Self::with_type_name(key, property_type.name())
    }
    pub fn with_type_name(key: &str, type_name: &str) -> Self {
        Self {
            key: key.to_owned(),
            name: None,
            type_name: type_name.to_owned(),
            required: false,
            choices: None,
            choices_callback: None,
            entity_type: None,
            multiple: false,
            sql_field: None,
            default: None,
        }
    }
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
    pub fn choices<'a>(mut self, choices: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.choices = Some(
            choices
                .into_iter()
                .map(|(value, label)| (value.to_owned(), label.to_owned()))
                .collect(),
        );
        self
    }
    pub fn choices_callback(mut self, callback: &str) -> Self {
        self.choices_callback = Some(callback.to_owned());
        self
    }
    pub fn references(mut self, entity_type: &str) -> Self {
        self.entity_type = Some(entity_type.to_owned());
        self
    }
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }
    pub fn sql_field(mut self, expression: &str) -> Self {
        self.sql_field = Some(expression.to_owned());
        self
    }
    pub fn default_value(mut self, value: impl Into<JsonValue>) -> Self {
        self.default = Some(value.into());
        self
    }
    pub fn property_type(&self) -> Option<PropertyType> {
        self.type_name.parse().ok()
    }
    /// Human label, falling back to the key.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }
}

// ------------- Special keys -------------
/// Properties that carry a recognized semantic role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl SpecialKeys {
    /// (role, property key) pairs for the roles that are set.
    pub fn assigned(&self) -> Vec<(&'static str, &str)> {
        [
            ("label", &self.label),
            ("project", &self.project),
            ("author", &self.author),
            ("uuid", &self.uuid),
        ]
        .into_iter()
        .filter_map(|(role, key)| key.as_deref().map(|k| (role, k)))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperation {
    pub label: String,
    /// `delete`, or a method name the entity class implements.
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl BulkOperation {
    pub fn new(label: &str, method: &str) -> Self {
        Self {
            label: label.to_owned(),
            method: method.to_owned(),
            success_message: None,
            color: None,
        }
    }
    pub fn success_message(mut self, message: &str) -> Self {
        self.success_message = Some(message.to_owned());
        self
    }
    pub fn color(mut self, color: &str) -> Self {
        self.color = Some(color.to_owned());
        self
    }
}

// ------------- Entity type -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeDeclaration {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_plural: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDeclaration>,
    #[serde(default)]
    pub special_keys: SpecialKeys,
    #[serde(default)]
    pub operations: BTreeSet<Operation>,
    #[serde(default)]
    pub bulk_operations: BTreeMap<String, BulkOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_class: Option<String>,
}

impl EntityTypeDeclaration {
    pub fn new(key: &str, label: &str) -> Self {
        Self {
            key: key.to_owned(),
            label: label.to_owned(),
            label_plural: None,
            icon: None,
            properties: Vec::new(),
            special_keys: SpecialKeys::default(),
            operations: BTreeSet::new(),
            bulk_operations: BTreeMap::new(),
            entity_class: None,
        }
    }
    pub fn plural(mut self, label_plural: &str) -> Self {
        self.label_plural = Some(label_plural.to_owned());
        self
    }
    pub fn property(mut self, property: PropertyDeclaration) -> Self {
        self.properties.push(property);
        self
    }
    pub fn label_key(mut self, key: &str) -> Self {
        self.special_keys.label = Some(key.to_owned());
        self
    }
    pub fn project_key(mut self, key: &str) -> Self {
        self.special_keys.project = Some(key.to_owned());
        self
    }
    pub fn author_key(mut self, key: &str) -> Self {
        self.special_keys.author = Some(key.to_owned());
        self
    }
    pub fn uuid_key(mut self, key: &str) -> Self {
        self.special_keys.uuid = Some(key.to_owned());
        self
    }
    pub fn operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations = operations.into_iter().collect();
        self
    }
    pub fn bulk_operation(mut self, name: &str, operation: BulkOperation) -> Self {
        self.bulk_operations.insert(name.to_owned(), operation);
        self
    }
    pub fn entity_class(mut self, class: &str) -> Self {
        self.entity_class = Some(class.to_owned());
        self
    }

    pub fn property_decl(&self, key: &str) -> Option<&PropertyDeclaration> {
        self.properties.iter().find(|p| p.key == key)
    }
    pub fn property_keys(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.key.as_str())
    }
    pub fn label_plural(&self) -> String {
        self.label_plural.clone().unwrap_or_else(|| format!("{}s", self.label))
    }
    pub fn allows(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }
}
