//! Entity store – a generic entity-persistence layer for plug-in modules.
//!
//! Modules declare typed *entity types* (a key, labels, an ordered list of
//! typed properties, special keys, permitted operations and bulk
//! operations). The store:
//! * validates and classifies each declaration as `ENABLED`, `PENDING` or
//!   `INVALID` ([`registry::EntityRegistry`]),
//! * provisions and drops one table per type ([`schema::SchemaManager`]),
//! * validates, coerces and persists instances as active records
//!   ([`entity::Entity`]),
//! * and queries them through a parameterized builder ([`query::EntityQuery`]).
//!
//! ## Modules
//! * [`sanitize`] – the identifier gate and literal escaping every SQL fragment goes through.
//! * [`datatype`] – the fixed property type enumeration, column mapping and typed values.
//! * [`declaration`] – entity type declarations and their builders.
//! * [`context`] – ambient facts supplied by the host (user, project, clock, lookups).
//! * [`module`] – the module interface, entity hooks and JSON-declared modules.
//! * [`persist`] – SQLite persistence, including the audit trail.
//! * [`bulk`] – bulk operations restricted to the declared ones.
//! * [`config`] – settings for the command line.
//!
//! ## Persistence
//! Every entity type is stored in `entity_store_<key>` with the columns
//! `id`, `created`, `updated` followed by the declared properties. Audit
//! events go to the shared `entity_store_log` table.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use entity_store::context::StaticContext;
//! use entity_store::datatype::PropertyType;
//! use entity_store::declaration::{EntityTypeDeclaration, PropertyDeclaration};
//! use entity_store::module::DeclarativeModule;
//! use entity_store::persist::PersistenceMode;
//! use entity_store::registry::EntityRegistry;
//! use serde_json::json;
//!
//! let registry = EntityRegistry::new(PersistenceMode::InMemory, Arc::new(StaticContext::new())).unwrap();
//! let site = EntityTypeDeclaration::new("site", "Site")
//!     .property(PropertyDeclaration::new("name", PropertyType::Text).required())
//!     .label_key("name");
//! registry.register_module(Arc::new(DeclarativeModule::new("sites", vec![site]))).unwrap();
//! registry.schema().build_table("site", false).unwrap();
//!
//! let acme = registry.create("site", json!({"name": "Acme"})).unwrap().unwrap();
//! assert_eq!(acme.get_label().as_deref(), Some("Acme"));
//! ```

pub mod bulk;
pub mod config;
pub mod context;
pub mod datatype;
pub mod declaration;
pub mod entity;
pub mod error;
pub mod module;
pub mod persist;
pub mod query;
pub mod registry;
pub mod sanitize;
pub mod schema;

pub use entity::{Entity, EntityState};
pub use error::{EntityError, Result, ValidationErrors};
pub use query::{EntityQuery, JoinType, QueryOutput};
pub use registry::{EntityRegistry, EntityTypeStatus};
