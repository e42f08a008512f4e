//! Core table descriptors.
//!
//! Core tables are the foundational warehouse tables created before any stage runs. They are
//! declared in `<core_dir>/core_tables.toml`:
//!
//! ```toml
//! [tables.students]
//! description = "Enrolled students"
//! protected_columns = ["id", "created_at"]
//! depends_on = ["programs"]
//! ```
//!
//! and each one is defined by the DDL in `<core_dir>/sql/<name>.sql`. The DDL must be
//! idempotent (`CREATE TABLE IF NOT EXISTS ...`): it runs on every bootstrap.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use fs_err as fs;
use serde::Deserialize;

use crate::{
    resolver::{self, ResolveError, Task},
    sql::{ValidateIdentifierError, validate_identifier},
};

/// Descriptor file name inside the core directory.
pub const CORE_TABLES_FILE: &str = "core_tables.toml";

/// Sub-directory holding one `<name>.sql` DDL file per core table.
pub const SQL_DIR: &str = "sql";

/// A core table declaration together with its DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreTableConfig {
    pub name: String,
    pub sql_definition: String,
    pub sql_path: PathBuf,
    pub description: String,
    pub protected_columns: Vec<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadCoreTablesError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A declared table has no `sql/<name>.sql` file
    #[error("no SQL definition for core table '{table_name}', expected {}", path.display())]
    MissingDefinition { table_name: String, path: PathBuf },

    #[error("invalid core table name '{table_name}'")]
    InvalidTableName {
        table_name: String,
        #[source]
        source: ValidateIdentifierError,
    },
}

#[derive(Debug, Default, Deserialize)]
struct CoreTablesFile {
    #[serde(default)]
    tables: BTreeMap<String, CoreTableEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct CoreTableEntry {
    #[serde(default)]
    description: String,
    #[serde(default)]
    protected_columns: Vec<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Load every core table declared under `core_dir`, in name order.
///
/// A missing `core_tables.toml` means there are no core tables.
pub fn load_core_tables(core_dir: &Path) -> Result<Vec<CoreTableConfig>, LoadCoreTablesError> {
    let descriptor_path = core_dir.join(CORE_TABLES_FILE);
    if !descriptor_path.is_file() {
        tracing::warn!(path = %descriptor_path.display(), "core_tables_descriptor_not_found");
        return Ok(Vec::new());
    }

    let text = fs::read_to_string(&descriptor_path).map_err(|err| LoadCoreTablesError::Read {
        path: descriptor_path.clone(),
        source: err,
    })?;
    let file: CoreTablesFile = toml::from_str(&text).map_err(|err| LoadCoreTablesError::Parse {
        path: descriptor_path.clone(),
        source: err,
    })?;

    let mut tables = Vec::with_capacity(file.tables.len());
    for (name, entry) in file.tables {
        validate_identifier(&name).map_err(|err| LoadCoreTablesError::InvalidTableName {
            table_name: name.clone(),
            source: err,
        })?;

        let sql_path = core_dir.join(SQL_DIR).join(format!("{name}.sql"));
        if !sql_path.is_file() {
            tracing::error!(table = %name, path = %sql_path.display(), "core_table_definition_missing");
            return Err(LoadCoreTablesError::MissingDefinition {
                table_name: name,
                path: sql_path,
            });
        }
        let sql_definition =
            fs::read_to_string(&sql_path).map_err(|err| LoadCoreTablesError::Read {
                path: sql_path.clone(),
                source: err,
            })?;

        tables.push(CoreTableConfig {
            name,
            sql_definition,
            sql_path,
            description: entry.description,
            protected_columns: entry.protected_columns,
            depends_on: entry.depends_on,
        });
    }

    tracing::info!(count = tables.len(), "core_tables_loaded");
    Ok(tables)
}

/// Order core tables so that each one is created after the tables it depends on.
///
/// Dependencies on undeclared tables are logged and ignored.
pub fn order_core_tables(
    tables: Vec<CoreTableConfig>,
) -> Result<Vec<CoreTableConfig>, ResolveError> {
    let declared: BTreeSet<&str> = tables.iter().map(|table| table.name.as_str()).collect();

    let tasks: Vec<Task> = tables
        .iter()
        .map(|table| {
            let requires = table.depends_on.iter().filter(|dependency| {
                let known = declared.contains(dependency.as_str());
                if !known {
                    tracing::warn!(
                        table = %table.name,
                        dependency = %dependency,
                        "core_table_dependency_undefined"
                    );
                }
                known
            });
            Task::new(table.name.as_str(), requires, [table.name.as_str()])
        })
        .collect();

    let order = resolver::resolve_order(&tasks, &BTreeSet::new())?;

    let mut by_name: BTreeMap<String, CoreTableConfig> = tables
        .into_iter()
        .map(|table| (table.name.clone(), table))
        .collect();
    Ok(order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect())
}

/// Render an ordered core table list as a text tree.
pub fn render_core_table_order(tables: &[CoreTableConfig]) -> String {
    if tables.is_empty() {
        return "  (No core tables configured)".to_string();
    }

    let mut lines = Vec::new();
    for (index, table) in tables.iter().enumerate() {
        lines.push(format!("  {}. {}", index + 1, table.name));
        if !table.depends_on.is_empty() {
            lines.push(format!("     ├── Depends on: {}", table.depends_on.join(", ")));
        }
        if !table.protected_columns.is_empty() {
            lines.push(format!(
                "     ├── Protected columns: {}",
                table.protected_columns.join(", ")
            ));
        }
        if !table.description.is_empty() {
            lines.push(format!("     └── Description: {}", table.description));
        }
    }
    lines.join("\n")
}
