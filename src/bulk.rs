//! Bulk operations: one named action applied to a selection of entities.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{EntityError, Result};
use crate::registry::EntityRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub operation: String,
    pub processed: Vec<i64>,
    /// Entity id with the reason it was not processed.
    pub failures: Vec<(i64, String)>,
    /// The declared success message, when at least one entity was processed.
    pub message: Option<String>,
}

impl BulkOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the bulk operation `operation` of `entity_type` on each id.
/// Only names the type declares are accepted. `delete` removes the rows;
/// any other method is handed to the entity class.
pub fn execute_bulk_operation(
    registry: &EntityRegistry,
    entity_type: &str,
    operation: &str,
    ids: &[i64],
) -> Result<BulkOutcome> {
    let info = registry
        .entity_type(entity_type)?
        .ok_or_else(|| EntityError::UnknownEntityType(entity_type.to_owned()))?;
    let declared = info.declaration.bulk_operations.get(operation).ok_or_else(|| {
        EntityError::InvalidArgument(format!(
            "'{operation}' is not a bulk operation of {entity_type}"
        ))
    })?;

    let mut outcome = BulkOutcome {
        operation: operation.to_owned(),
        ..BulkOutcome::default()
    };
    for &id in ids {
        let mut entity = match registry.get_instance(entity_type, Some(id))? {
            Some(entity) => entity,
            None => {
                outcome.failures.push((id, format!("{entity_type} #{id} does not exist")));
                continue;
            }
        };
        let result = if declared.method == "delete" {
            entity.delete()
        } else {
            match info.kind.hooks() {
                Some(hooks) => hooks.bulk_operation(&declared.method, &mut entity),
                None => Err(EntityError::InvalidArgument(format!(
                    "{entity_type} has no entity class for '{}'",
                    declared.method
                ))),
            }
        };
        match result {
            Ok(()) => outcome.processed.push(id),
            Err(e) => {
                warn!(entity_type, operation, id, error = %e, "bulk operation failed");
                outcome.failures.push((id, e.to_string()));
            }
        }
    }

    if !outcome.processed.is_empty() {
        outcome.message = match &declared.success_message {
            Some(message) => Some(message.clone()),
            None if declared.method == "delete" => {
                Some(format!("The {} have been deleted.", info.declaration.label_plural()))
            }
            None => None,
        };
    }
    info!(
        entity_type,
        operation,
        processed = outcome.processed.len(),
        failed = outcome.failures.len(),
        "bulk operation finished"
    );
    Ok(outcome)
}
