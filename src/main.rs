//! Schema manager for the entity store.
//!
//! Usage:
//!   entity-store [--config FILE] status
//!   entity-store build site [--reset]
//!   entity-store drop site --confirm entity_store_site

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use entity_store::config::Settings;
use entity_store::module::{on_module_disabled, on_module_enabled, DeclarativeModule};
use entity_store::registry::{EntityRegistry, ALL_STATUSES};
use entity_store::sanitize::table_name;
use entity_store::{EntityError, Result};

#[derive(Parser, Debug)]
#[command(name = "entity-store")]
#[command(about = "Builds, inspects and drops entity type tables")]
struct Args {
    /// Settings file (JSON); defaults to entity_store.json when present
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every entity type with its status
    Status,
    /// Create the table of a pending entity type
    Build {
        entity_type: String,
        /// Drop and recreate an existing table, losing its rows
        #[arg(long)]
        reset: bool,
    },
    /// Drop the table of an enabled entity type with all its rows
    Drop {
        entity_type: String,
        /// The table name, typed out
        #[arg(long)]
        confirm: String,
    },
    /// Build the tables of a module
    Enable { module: String },
    /// Drop the tables of a module
    Disable {
        module: String,
        /// The module prefix, typed out
        #[arg(long)]
        confirm: String,
    },
    /// Count the rows of an enabled entity type
    Count { entity_type: String },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match run(&settings, args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: &Settings, command: Command) -> Result<()> {
    let registry = EntityRegistry::new(settings.persistence_mode(), Arc::new(settings.context()))?;
    for path in &settings.modules {
        registry.register_module(Arc::new(DeclarativeModule::from_file(path)?))?;
    }
    info!(database = %settings.database, modules = settings.modules.len(), "entity store opened");
    let schema = registry.schema();

    match command {
        Command::Status => {
            println!("{:<32} {:<8} {:<24} {}", "ENTITY TYPE", "STATUS", "MODULE", "DETAILS");
            for info in registry.entity_types(&ALL_STATUSES)? {
                let details = if info.is_enabled() {
                    format!("{} rows", schema.row_count(info.key())?)
                } else {
                    info.issues.join("; ")
                };
                println!("{:<32} {:<8} {:<24} {}", info.key(), info.status, info.module, details);
            }
        }
        Command::Build { entity_type, reset } => {
            if schema.build_table(&entity_type, reset)? {
                println!("Built {}", table_name(&entity_type)?);
            } else {
                println!("{} already exists, use --reset to rebuild it", table_name(&entity_type)?);
            }
        }
        Command::Drop { entity_type, confirm } => {
            let table = table_name(&entity_type)?;
            if confirm != table {
                return Err(EntityError::InvalidArgument(format!(
                    "type the table name '{table}' to confirm"
                )));
            }
            if schema.drop_table(&entity_type)? {
                println!("Dropped {table}");
            } else {
                println!("{table} does not exist");
            }
        }
        Command::Enable { module } => {
            if registry.module(&module)?.is_none() {
                return Err(EntityError::Config(format!("module '{module}' is not configured")));
            }
            let built = on_module_enabled(&registry, &module)?;
            println!("Built {} table(s): {}", built.len(), built.join(", "));
        }
        Command::Disable { module, confirm } => {
            if confirm != module {
                return Err(EntityError::InvalidArgument(format!(
                    "type the module prefix '{module}' to confirm"
                )));
            }
            let dropped = on_module_disabled(&registry, &module)?;
            println!("Dropped {} table(s): {}", dropped.len(), dropped.join(", "));
        }
        Command::Count { entity_type } => {
            let count = registry
                .query(&entity_type)?
                .count_query()
                .execute(false, true)?
                .count();
            println!("{count}");
        }
    }
    Ok(())
}
