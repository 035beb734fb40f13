//! The entity type registry: collects declarations from registered modules,
//! validates them, classifies each one and serves as the directory that
//! entities, queries and the schema manager look types up in.
//!
//! Classification is memoized per module and recomputed by [`EntityRegistry::reset`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::context::HostContext;
use crate::datatype::PropertyType;
use crate::declaration::{EntityTypeDeclaration, BASE_COLUMNS, MAX_KEY_LENGTH};
use crate::entity::Entity;
use crate::error::{EntityError, Result};
use crate::module::{EntityKind, EntityModule};
use crate::persist::{PersistenceMode, Persistor};
use crate::query::EntityQuery;
use crate::sanitize::{is_identifier, table_name};
use crate::schema::SchemaManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityTypeStatus {
    /// Valid and its table exists.
    Enabled,
    /// Valid, table not built yet.
    Pending,
    Invalid,
}

pub const ALL_STATUSES: [EntityTypeStatus; 3] = [
    EntityTypeStatus::Enabled,
    EntityTypeStatus::Pending,
    EntityTypeStatus::Invalid,
];

impl fmt::Display for EntityTypeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EntityTypeStatus::Enabled => "ENABLED",
            EntityTypeStatus::Pending => "PENDING",
            EntityTypeStatus::Invalid => "INVALID",
        };
        f.pad(name)
    }
}

/// A loaded declaration together with what the registry derived from it.
#[derive(Debug, Clone)]
pub struct EntityTypeInfo {
    pub declaration: EntityTypeDeclaration,
    pub module: String,
    pub status: EntityTypeStatus,
    pub issues: Vec<String>,
    pub kind: EntityKind,
}

impl EntityTypeInfo {
    pub fn key(&self) -> &str {
        &self.declaration.key
    }
    pub fn table_name(&self) -> Result<String> {
        table_name(&self.declaration.key)
    }
    pub fn is_enabled(&self) -> bool {
        self.status == EntityTypeStatus::Enabled
    }
}

#[derive(Default)]
struct Catalog {
    modules: Vec<Arc<dyn EntityModule>>,
    loaded: HashSet<String>,
    types: BTreeMap<String, Arc<EntityTypeInfo>>,
}

impl Catalog {
    fn module(&self, prefix: &str) -> Option<Arc<dyn EntityModule>> {
        self.modules.iter().find(|m| m.prefix() == prefix).cloned()
    }
}

pub struct EntityRegistry {
    persistor: Mutex<Persistor>,
    context: Arc<dyn HostContext>,
    catalog: Mutex<Catalog>,
}

impl EntityRegistry {
    pub fn new(mode: PersistenceMode, context: Arc<dyn HostContext>) -> Result<Self> {
        Ok(Self::with_persistor(Persistor::new(mode)?, context))
    }
    pub fn with_persistor(persistor: Persistor, context: Arc<dyn HostContext>) -> Self {
        Self {
            persistor: Mutex::new(persistor),
            context,
            catalog: Mutex::new(Catalog::default()),
        }
    }
    pub fn context(&self) -> &dyn HostContext {
        self.context.as_ref()
    }
    /// Exclusive access to the store. Do not hold the guard across calls
    /// back into the registry.
    pub fn persistor(&self) -> Result<MutexGuard<'_, Persistor>> {
        Ok(self.persistor.lock()?)
    }
    fn catalog(&self) -> Result<MutexGuard<'_, Catalog>> {
        Ok(self.catalog.lock()?)
    }

    // ------------- Modules -------------
    /// Adds a module and classifies its entity types. Registering a prefix
    /// twice keeps the first module.
    pub fn register_module(&self, module: Arc<dyn EntityModule>) -> Result<Vec<Arc<EntityTypeInfo>>> {
        let prefix = module.prefix().to_owned();
        {
            let mut catalog = self.catalog()?;
            if catalog.module(&prefix).is_some() {
                warn!(prefix = %prefix, "module already registered");
            } else {
                catalog.modules.push(module);
            }
        }
        self.load_module_entity_types(&prefix)
    }
    /// Forgets a module and every type it contributed.
    pub fn unregister_module(&self, prefix: &str) -> Result<()> {
        let mut catalog = self.catalog()?;
        catalog.modules.retain(|m| m.prefix() != prefix);
        catalog.loaded.remove(prefix);
        catalog.types.retain(|_, info| info.module != prefix);
        info!(prefix, "module unregistered");
        Ok(())
    }
    pub fn module(&self, prefix: &str) -> Result<Option<Arc<dyn EntityModule>>> {
        Ok(self.catalog()?.module(prefix))
    }
    /// Prefixes of the registered modules with their versions.
    pub fn modules(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .catalog()?
            .modules
            .iter()
            .map(|m| (m.prefix().to_owned(), m.version().to_owned()))
            .collect())
    }

    /// Validates and classifies the entity types of one registered module.
    /// A second call for the same module returns the memoized result.
    pub fn load_module_entity_types(&self, prefix: &str) -> Result<Vec<Arc<EntityTypeInfo>>> {
        let module = {
            let catalog = self.catalog()?;
            if catalog.loaded.contains(prefix) {
                return Ok(catalog
                    .types
                    .values()
                    .filter(|info| info.module == prefix)
                    .cloned()
                    .collect());
            }
            match catalog.module(prefix) {
                Some(module) => module,
                None => return Ok(Vec::new()),
            }
        };

        let mut classified = Vec::new();
        for declaration in module.entity_types() {
            let (issues, kind) = validate_declaration(&declaration, module.as_ref());
            let status = if issues.is_empty() {
                self.classify(&declaration.key)?
            } else {
                warn!(entity_type = %declaration.key, issues = ?issues, "invalid entity type");
                EntityTypeStatus::Invalid
            };
            classified.push(EntityTypeInfo {
                declaration,
                module: prefix.to_owned(),
                status,
                issues,
                kind,
            });
        }

        let mut catalog = self.catalog()?;
        let mut result = Vec::new();
        for info in classified {
            if let Some(existing) = catalog.types.get(info.key()) {
                if existing.module != prefix {
                    warn!(
                        entity_type = %info.key(),
                        owner = %existing.module,
                        module = prefix,
                        "entity type already declared by another module, skipped"
                    );
                    continue;
                }
            }
            let info = Arc::new(info);
            catalog.types.insert(info.key().to_owned(), Arc::clone(&info));
            result.push(info);
        }
        catalog.loaded.insert(prefix.to_owned());
        info!(module = prefix, entity_types = result.len(), "module entity types loaded");
        Ok(result)
    }

    fn classify(&self, key: &str) -> Result<EntityTypeStatus> {
        let table = table_name(key)?;
        Ok(if self.persistor()?.table_exists(&table)? {
            EntityTypeStatus::Enabled
        } else {
            EntityTypeStatus::Pending
        })
    }

    /// Recomputes ENABLED/PENDING for one valid type after its table changed.
    pub fn refresh_status(&self, key: &str) -> Result<()> {
        let current = match self.catalog()?.types.get(key) {
            Some(info) => Arc::clone(info),
            None => return Ok(()),
        };
        if current.status == EntityTypeStatus::Invalid {
            return Ok(());
        }
        let status = self.classify(key)?;
        if status != current.status {
            let mut refreshed = (*current).clone();
            refreshed.status = status;
            debug!(entity_type = key, %status, "status refreshed");
            self.catalog()?.types.insert(key.to_owned(), Arc::new(refreshed));
        }
        Ok(())
    }

    /// Drops every classification and reloads all registered modules.
    pub fn reset(&self) -> Result<()> {
        let prefixes: Vec<String> = {
            let mut catalog = self.catalog()?;
            catalog.types.clear();
            catalog.loaded.clear();
            catalog.modules.iter().map(|m| m.prefix().to_owned()).collect()
        };
        for prefix in &prefixes {
            self.load_module_entity_types(prefix)?;
        }
        info!(modules = prefixes.len(), "registry reset");
        Ok(())
    }

    // ------------- Lookup -------------
    /// The type, if its current status is one of `statuses`.
    pub fn entity_type_info(
        &self,
        key: &str,
        statuses: &[EntityTypeStatus],
    ) -> Result<Option<Arc<EntityTypeInfo>>> {
        Ok(self
            .catalog()?
            .types
            .get(key)
            .filter(|info| statuses.contains(&info.status))
            .cloned())
    }
    /// The type, only if it is enabled.
    pub fn entity_type(&self, key: &str) -> Result<Option<Arc<EntityTypeInfo>>> {
        self.entity_type_info(key, &[EntityTypeStatus::Enabled])
    }
    pub fn entity_type_exists(&self, key: &str) -> Result<bool> {
        Ok(self.entity_type(key)?.is_some())
    }
    pub fn entity_types(&self, statuses: &[EntityTypeStatus]) -> Result<Vec<Arc<EntityTypeInfo>>> {
        Ok(self
            .catalog()?
            .types
            .values()
            .filter(|info| statuses.contains(&info.status))
            .cloned()
            .collect())
    }
    pub fn table_exists(&self, key: &str) -> Result<bool> {
        let table = table_name(key)?;
        self.persistor()?.table_exists(&table)
    }

    // ------------- Factories -------------
    /// A new entity (no id), or the stored one. `None` when the type is
    /// not enabled or the row does not exist.
    pub fn get_instance(&self, key: &str, id: Option<i64>) -> Result<Option<Entity<'_>>> {
        let info = match self.entity_type(key)? {
            Some(info) => info,
            None => return Ok(None),
        };
        match id {
            None => Ok(Some(Entity::new(self, info))),
            Some(id) => match Entity::load(self, info, id) {
                Ok(entity) => Ok(Some(entity)),
                Err(EntityError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }
    /// All of the requested entities in the given order, or `None` if any is missing.
    pub fn load_instances(&self, key: &str, ids: &[i64]) -> Result<Option<Vec<Entity<'_>>>> {
        let info = match self.entity_type(key)? {
            Some(info) => info,
            None => return Ok(None),
        };
        let mut entities = Vec::with_capacity(ids.len());
        for &id in ids {
            match Entity::load(self, Arc::clone(&info), id) {
                Ok(entity) => entities.push(entity),
                Err(EntityError::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(Some(entities))
    }
    /// Validates and inserts a new entity. `None` when the type is not
    /// enabled; rejected input is `ValidationFailed`.
    pub fn create(&self, key: &str, data: JsonValue) -> Result<Option<Entity<'_>>> {
        let mut entity = match self.get_instance(key, None)? {
            Some(entity) => entity,
            None => return Ok(None),
        };
        entity.create(data)?;
        Ok(Some(entity))
    }
    pub fn query(&self, key: &str) -> Result<EntityQuery<'_>> {
        match self.entity_type(key)? {
            Some(info) => Ok(EntityQuery::new(self, info)),
            None => Err(EntityError::UnknownEntityType(key.to_owned())),
        }
    }
    pub fn schema(&self) -> SchemaManager<'_> {
        SchemaManager::new(self)
    }
}

/// Structural checks on one declaration. Collects every issue rather than
/// stopping at the first.
pub fn validate_declaration(
    declaration: &EntityTypeDeclaration,
    module: &dyn EntityModule,
) -> (Vec<String>, EntityKind) {
    let mut issues = Vec::new();
    let key = &declaration.key;

    if !is_identifier(key) {
        issues.push(format!("Entity type key '{key}' must contain only letters, digits and underscores"));
    } else if key.len() > MAX_KEY_LENGTH {
        issues.push(format!("Entity type key '{key}' is longer than {MAX_KEY_LENGTH} characters"));
    }
    if declaration.label.trim().is_empty() {
        issues.push("Missing label".to_owned());
    }

    let kind = match &declaration.entity_class {
        None => EntityKind::Generic,
        Some(name) => match module.entity_class(name) {
            Some(hooks) => EntityKind::Custom(hooks),
            None => {
                issues.push(format!("Entity class '{name}' cannot be loaded"));
                EntityKind::Generic
            }
        },
    };

    if declaration.properties.is_empty() {
        issues.push("No properties declared".to_owned());
    }
    let mut seen = HashSet::new();
    for property in &declaration.properties {
        let pkey = &property.key;
        if !is_identifier(pkey) {
            issues.push(format!("Property key '{pkey}' must contain only letters, digits and underscores"));
        }
        if BASE_COLUMNS.contains(&pkey.as_str()) {
            issues.push(format!("Property key '{pkey}' is reserved"));
        }
        if !seen.insert(pkey.as_str()) {
            issues.push(format!("Property '{pkey}' is declared more than once"));
        }
        match property.property_type() {
            None => issues.push(format!("Property '{pkey}' has an invalid type '{}'", property.type_name)),
            Some(PropertyType::EntityReference) => match &property.entity_type {
                None => issues.push(format!("Property '{pkey}' must name the referenced entity type")),
                Some(target) if !is_identifier(target) => {
                    issues.push(format!("Property '{pkey}' references an invalid entity type '{target}'"))
                }
                _ => {}
            },
            Some(_) if property.multiple => {
                issues.push(format!("Property '{pkey}' cannot be multiple unless it is an entity reference"))
            }
            Some(_) => {}
        }
        if property.choices_callback.is_some() && declaration.entity_class.is_none() {
            issues.push(format!("Property '{pkey}' has a choices callback but the type has no entity class"));
        }
    }

    for (role, pkey) in declaration.special_keys.assigned() {
        let property = match declaration.property_decl(pkey) {
            Some(property) => property,
            None => {
                issues.push(format!("Special key '{role}' points to undeclared property '{pkey}'"));
                continue;
            }
        };
        let expected = match role {
            "project" => Some(PropertyType::Project),
            "author" => Some(PropertyType::User),
            _ => None,
        };
        if let Some(expected) = expected {
            if property.property_type() != Some(expected) {
                issues.push(format!("Special key '{role}' must point to a {expected} property"));
            }
        }
    }

    for (name, operation) in &declaration.bulk_operations {
        if !is_identifier(name) {
            issues.push(format!("Bulk operation name '{name}' must contain only letters, digits and underscores"));
        }
        if operation.method != "delete" && declaration.entity_class.is_none() {
            issues.push(format!(
                "Bulk operation '{name}' calls '{}', which requires an entity class",
                operation.method
            ));
        }
    }

    (issues, kind)
}
