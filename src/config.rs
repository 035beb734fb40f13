//! Settings for the command line, read from an optional JSON file layered
//! with `ENTITY_STORE_*` environment variables.

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::context::StaticContext;
use crate::error::Result;
use crate::persist::PersistenceMode;

pub const DEFAULT_CONFIG_FILE: &str = "entity_store.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    /// `:memory:` or a database file path.
    pub database: String,
    /// JSON module declaration files registered at startup.
    #[serde(default)]
    pub modules: Vec<String>,
    pub log_filter: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub project: Option<i64>,
    #[serde(default)]
    pub super_user: bool,
}

impl Settings {
    /// Reads `path`. The file may be missing only when it is the default one.
    pub fn load(path: Option<&str>) -> Result<Settings> {
        let (file, required) = match path {
            Some(path) => (path, true),
            None => (DEFAULT_CONFIG_FILE, false),
        };
        let settings = Config::builder()
            .set_default("database", "entity_store.db")?
            .set_default("log_filter", "info")?
            .add_source(File::new(file, FileFormat::Json).required(required))
            .add_source(
                Environment::with_prefix("ENTITY_STORE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("modules"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        PersistenceMode::from_setting(&self.database)
    }

    /// Ambient context for command-line use.
    pub fn context(&self) -> StaticContext {
        let mut context = StaticContext::new();
        if let Some(user) = &self.user {
            context = context.acting_as(user);
        }
        if let Some(project) = self.project {
            context = context.in_project(project);
        }
        if self.super_user {
            context = context.super_user();
        }
        context
    }
}
