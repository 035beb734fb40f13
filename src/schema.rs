//! Provisions and removes the table behind each entity type.

use tracing::{info, warn};

use crate::datatype::PropertyType;
use crate::declaration::{EntityTypeDeclaration, PropertyDeclaration};
use crate::error::{EntityError, Result};
use crate::registry::{EntityRegistry, EntityTypeInfo, EntityTypeStatus, ALL_STATUSES};
use crate::sanitize::{quote_identifier, quoted_table_name, table_name};

/// Column definition for one declared property.
pub fn column_definition(entity_type: &str, property: &PropertyDeclaration) -> Result<String> {
    let property_type =
        property
            .property_type()
            .ok_or_else(|| EntityError::UnsupportedPropertyType {
                entity_type: entity_type.to_owned(),
                property: property.key.clone(),
                property_type: property.type_name.clone(),
            })?;
    // several references are kept as a JSON array
    let column_type = if property.multiple && property_type == PropertyType::EntityReference {
        "TEXT"
    } else {
        property_type.column_type()
    };
    let mut column = format!("{} {}", quote_identifier(&property.key)?, column_type);
    if property.required {
        column.push_str(" NOT NULL");
    }
    Ok(column)
}

/// The `CREATE TABLE IF NOT EXISTS` statement for a declaration. Fails on
/// the first property whose type is outside the fixed enumeration.
pub fn table_definition(declaration: &EntityTypeDeclaration) -> Result<String> {
    let mut columns = vec![
        "\"id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT".to_owned(),
        "\"created\" INT UNSIGNED NOT NULL".to_owned(),
        "\"updated\" INT UNSIGNED NOT NULL".to_owned(),
    ];
    for property in &declaration.properties {
        columns.push(column_definition(&declaration.key, property)?);
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quoted_table_name(&declaration.key)?,
        columns.join(", ")
    ))
}

pub struct SchemaManager<'r> {
    registry: &'r EntityRegistry,
}

impl<'r> SchemaManager<'r> {
    pub fn new(registry: &'r EntityRegistry) -> Self {
        Self { registry }
    }

    fn lookup(&self, key: &str) -> Result<std::sync::Arc<EntityTypeInfo>> {
        self.registry
            .entity_type_info(key, &ALL_STATUSES)?
            .ok_or_else(|| EntityError::UnknownEntityType(key.to_owned()))
    }

    /// Creates the table of a pending type. An enabled type is rebuilt
    /// (dropped, then created empty) only with `reset_existing`; otherwise
    /// nothing happens. Returns whether DDL was issued.
    pub fn build_table(&self, key: &str, reset_existing: bool) -> Result<bool> {
        let info = self.lookup(key)?;
        match info.status {
            EntityTypeStatus::Invalid => {
                table_definition(&info.declaration)?;
                return Err(EntityError::InvalidTransition {
                    entity_type: key.to_owned(),
                    status: info.status,
                    operation: "build",
                });
            }
            EntityTypeStatus::Enabled if !reset_existing => {
                warn!(entity_type = key, "table already built, pass reset to rebuild it");
                return Ok(false);
            }
            _ => {}
        }
        let ddl = table_definition(&info.declaration)?;
        {
            let mut persistor = self.registry.persistor()?;
            if reset_existing {
                persistor.execute_ddl(&format!("DROP TABLE IF EXISTS {}", quoted_table_name(key)?))?;
            }
            persistor.execute_ddl(&ddl)?;
        }
        info!(entity_type = key, table = %table_name(key)?, reset = reset_existing, "table built");
        self.registry.refresh_status(key)?;
        Ok(true)
    }

    /// Drops the table of an enabled type with all its rows. A pending type
    /// has nothing to drop. Returns whether DDL was issued.
    pub fn drop_table(&self, key: &str) -> Result<bool> {
        let info = self.lookup(key)?;
        match info.status {
            EntityTypeStatus::Enabled => {}
            EntityTypeStatus::Pending => {
                warn!(entity_type = key, "no table to drop");
                return Ok(false);
            }
            EntityTypeStatus::Invalid => {
                return Err(EntityError::InvalidTransition {
                    entity_type: key.to_owned(),
                    status: info.status,
                    operation: "drop",
                });
            }
        }
        self.registry
            .persistor()?
            .execute_ddl(&format!("DROP TABLE IF EXISTS {}", quoted_table_name(key)?))?;
        info!(entity_type = key, "table dropped");
        self.registry.refresh_status(key)?;
        Ok(true)
    }

    pub fn table_exists(&self, key: &str) -> Result<bool> {
        self.registry.table_exists(key)
    }

    pub fn row_count(&self, key: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(\"id\") FROM {}", quoted_table_name(key)?);
        self.registry.persistor()?.select_scalar(&sql, &[])
    }

    /// Builds every valid type of a module that has no table yet.
    /// Returns the keys built; invalid types are skipped.
    pub fn build_schema_for_module(&self, prefix: &str) -> Result<Vec<String>> {
        let mut built = Vec::new();
        for info in self.registry.load_module_entity_types(prefix)? {
            if info.status == EntityTypeStatus::Invalid {
                warn!(entity_type = %info.key(), issues = ?info.issues, "invalid entity type not built");
                continue;
            }
            if self.build_table(info.key(), false)? {
                built.push(info.key().to_owned());
            }
        }
        Ok(built)
    }

    /// Drops the tables of every enabled type of a module.
    pub fn drop_schema_for_module(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dropped = Vec::new();
        for info in self.registry.load_module_entity_types(prefix)? {
            let current = self.lookup(info.key())?;
            if current.status == EntityTypeStatus::Enabled && current.module == prefix {
                self.drop_table(info.key())?;
                dropped.push(info.key().to_owned());
            }
        }
        Ok(dropped)
    }
}
