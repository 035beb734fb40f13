//! Modules contribute entity types; entity classes attach behavior to them.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::declaration::EntityTypeDeclaration;
use crate::entity::Entity;
use crate::error::{EntityError, Result};
use crate::persist::EventType;
use crate::registry::EntityRegistry;
use crate::schema::SchemaManager;

/// What a module must provide to participate in the entity store.
pub trait EntityModule: Send + Sync {
    fn prefix(&self) -> &str;
    fn version(&self) -> &str {
        "1.0.0"
    }
    /// Declarations in the order the module lists them. Called once per
    /// module until the registry is reset.
    fn entity_types(&self) -> Vec<EntityTypeDeclaration>;
    /// Resolves an `entity_class` name to its hooks.
    fn entity_class(&self, _name: &str) -> Option<Arc<dyn EntityHooks>> {
        None
    }
}

/// Domain logic an entity class may layer over the generic entity.
/// Every method has a neutral default, so a class only implements what it needs.
pub trait EntityHooks: Send + Sync {
    /// Choices for a property declaring `choices_callback`.
    fn resolve_choices(&self, _callback: &str) -> Option<BTreeMap<String, String>> {
        None
    }
    fn loggable_events(&self) -> Vec<EventType> {
        Vec::new()
    }
    /// Extra check after the type validator passed. `Some(message)` rejects the value.
    fn validate_property(&self, _key: &str, _value: &JsonValue) -> Option<String> {
        None
    }
    fn log_message(&self, _event: EventType, _entity: &Entity<'_>) -> Option<String> {
        None
    }
    /// Runs a declared bulk operation other than `delete` on one entity.
    fn bulk_operation(&self, method: &str, _entity: &mut Entity<'_>) -> Result<()> {
        Err(EntityError::InvalidArgument(format!(
            "bulk operation method '{method}' is not implemented"
        )))
    }
}

/// Resolved once when a declaration is loaded.
#[derive(Clone, Default)]
pub enum EntityKind {
    #[default]
    Generic,
    Custom(Arc<dyn EntityHooks>),
}

impl EntityKind {
    pub fn hooks(&self) -> Option<&dyn EntityHooks> {
        match self {
            EntityKind::Generic => None,
            EntityKind::Custom(hooks) => Some(hooks.as_ref()),
        }
    }
    pub fn is_custom(&self) -> bool {
        matches!(self, EntityKind::Custom(_))
    }
}

impl fmt::Debug for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntityKind::Generic => write!(f, "Generic"),
            EntityKind::Custom(_) => write!(f, "Custom"),
        }
    }
}

// ------------- Declarative modules -------------
fn default_version() -> String {
    "1.0.0".to_owned()
}

/// A module whose declarations come from a JSON document:
/// `{"prefix": "...", "version": "...", "entity_types": [...]}`.
/// It has no entity classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclarativeModule {
    pub prefix: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeDeclaration>,
}

impl DeclarativeModule {
    pub fn new(prefix: &str, entity_types: Vec<EntityTypeDeclaration>) -> Self {
        Self {
            prefix: prefix.to_owned(),
            version: default_version(),
            entity_types,
        }
    }
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| EntityError::Config(format!("cannot read {}: {e}", path.display())))?;
        let module = Self::from_json(&json)?;
        info!(prefix = %module.prefix, path = %path.display(), "module declaration read");
        Ok(module)
    }
}

impl EntityModule for DeclarativeModule {
    fn prefix(&self) -> &str {
        &self.prefix
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn entity_types(&self) -> Vec<EntityTypeDeclaration> {
        self.entity_types.clone()
    }
}

// ------------- Lifecycle hooks -------------
/// Host callback when a module is enabled: provisions the tables of its
/// valid types. Returns the keys of the tables built.
pub fn on_module_enabled(registry: &EntityRegistry, prefix: &str) -> Result<Vec<String>> {
    registry.reset()?;
    let built = SchemaManager::new(registry).build_schema_for_module(prefix)?;
    info!(prefix, tables = built.len(), "module enabled");
    Ok(built)
}

/// Host callback when a module is disabled: drops the tables of its
/// provisioned types and forgets the module.
pub fn on_module_disabled(registry: &EntityRegistry, prefix: &str) -> Result<Vec<String>> {
    let dropped = SchemaManager::new(registry).drop_schema_for_module(prefix)?;
    registry.unregister_module(prefix)?;
    info!(prefix, tables = dropped.len(), "module disabled");
    Ok(dropped)
}
