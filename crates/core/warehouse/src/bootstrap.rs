//! Core schema bootstrap.
//!
//! Core tables are created in dependency order before any stage runs. The columns each one
//! ends up with become protected: later promotions never add or overwrite them.

use std::path::Path;

use staging::{
    CoreTableConfig, LoadCoreTablesError, ResolveError,
    core_tables::{load_core_tables, order_core_tables},
};

use crate::{
    cache::SchemaCache,
    store::{Database, Store, StoreError},
};

/// Errors that can occur while bootstrapping the core schema.
///
/// Every variant aborts the bootstrap: no partial core schema is worked on.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to load core table descriptors")]
    Load(#[source] LoadCoreTablesError),

    #[error("failed to order core tables")]
    Order(#[source] ResolveError),

    #[error("failed to execute the DDL of core table '{table_name}'")]
    ExecuteDdl {
        table_name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to read the columns of core table '{table_name}'")]
    Introspect {
        table_name: String,
        #[source]
        source: StoreError,
    },
}

/// Load, order and create the core tables declared under `core_dir`.
///
/// Returns the tables in creation order.
#[tracing::instrument(skip_all, err)]
pub async fn bootstrap_core_schema(
    store: &Store,
    cache: &mut SchemaCache,
    core_dir: &Path,
) -> Result<Vec<CoreTableConfig>, BootstrapError> {
    let tables = load_core_tables(core_dir).map_err(BootstrapError::Load)?;
    if tables.is_empty() {
        tracing::warn!(core_dir = %core_dir.display(), "no_core_tables");
        return Ok(tables);
    }
    let tables = order_core_tables(tables).map_err(BootstrapError::Order)?;

    for table in &tables {
        create_core_table(store, cache, table).await?;
    }

    tracing::info!(count = tables.len(), "core_schema_bootstrapped");
    Ok(tables)
}

async fn create_core_table(
    store: &Store,
    cache: &mut SchemaCache,
    table: &CoreTableConfig,
) -> Result<(), BootstrapError> {
    store
        .execute(Database::Warehouse, &table.sql_definition)
        .await
        .map_err(|err| {
            tracing::error!(
                table = %table.name,
                error = %err,
                error_source = monitoring::logging::error_source(&err),
                "core_table_creation_failed"
            );
            BootstrapError::ExecuteDdl {
                table_name: table.name.clone(),
                source: err,
            }
        })?;

    let columns = store
        .columns(Database::Warehouse, &table.name)
        .await
        .map_err(|err| BootstrapError::Introspect {
            table_name: table.name.clone(),
            source: err,
        })?;

    cache.invalidate(Database::Warehouse, &table.name);
    cache.protect(&table.name, columns.iter().map(|column| column.name.as_str()));
    cache.protect(&table.name, table.protected_columns.iter().map(String::as_str));

    tracing::info!(
        table = %table.name,
        columns = columns.len(),
        "core_table_ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    mod it_bootstrap;
}
