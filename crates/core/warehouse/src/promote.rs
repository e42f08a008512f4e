//! Promotion of raw staging views into warehouse tables.
//!
//! A datamart `from AS to` is promoted in one of two ways:
//!
//! ```text
//!                   ┌─ `to` absent ──► CREATE TABLE ─► COPY raw→warehouse ─► primary key ─► foreign keys
//! datamart ─────────┤
//!                   └─ `to` exists ──► drift check ─► ADD COLUMN ─► COPY into temp_<to> ─► upsert / append
//! ```
//!
//! Rows travel over the COPY protocol: the raw side streams `COPY (SELECT ...) TO STDOUT` straight
//! into the warehouse side's `COPY ... FROM STDIN`. Every statement auto-commits, so a failure
//! half way leaves whatever was already done in place.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use config::TypeDriftPolicy;
use sqlx::PgConnection;
use staging::{
    Datamart,
    sql::{ValidateIdentifierError, ident, ident_list, validate_identifier},
};

use crate::{
    cache::SchemaCache,
    store::{ColumnInfo, Database, Store, StoreError},
};

/// Prefix of the session-temporary table used by re-promotions.
pub const TEMP_TABLE_PREFIX: &str = "temp_";

/// A same-name column whose type differs between the source and the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDrift {
    pub column: String,
    pub warehouse_type: String,
    pub source_type: String,
}

impl fmt::Display for TypeDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} in the warehouse, {} in the source)",
            self.column, self.warehouse_type, self.source_type
        )
    }
}

/// What a promotion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// The warehouse table did not exist and was created
    Created {
        rows: u64,
        primary_key: PrimaryKeyPlan,
        foreign_keys: Vec<ForeignKeyPlan>,
    },
    /// The warehouse table existed and the source was merged into it
    Merged {
        rows: u64,
        added_columns: Vec<String>,
        upsert: bool,
    },
}

/// Primary key given to a newly created table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKeyPlan {
    /// The source's own primary key column
    Natural(String),
    /// A fabricated `SERIAL` column
    Surrogate(String),
}

impl PrimaryKeyPlan {
    pub fn column(&self) -> &str {
        match self {
            PrimaryKeyPlan::Natural(column) | PrimaryKeyPlan::Surrogate(column) => column,
        }
    }
}

/// A foreign key constraint to add to a newly created table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyPlan {
    pub constraint: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Errors that can occur while promoting one datamart.
#[derive(Debug, thiserror::Error)]
pub enum PromoteError {
    /// `from` has no columns in the raw store, typically because it does not exist
    #[error("source '{view}' does not exist in the raw database")]
    SourceNotFound { view: String },

    #[error("generated name '{name}' is not a valid identifier")]
    InvalidIdentifier {
        name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// A foreign key points at a raw table that no datamart of the stage promoted
    #[error(
        "foreign key '{table_name}.{column}' references '{references_table}', which is not promoted by this stage"
    )]
    UnresolvedForeignKey {
        table_name: String,
        column: String,
        references_table: String,
    },

    #[error(
        "column types of '{table_name}' changed: {}",
        drifts.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )]
    SchemaDrift {
        table_name: String,
        drifts: Vec<TypeDrift>,
    },

    #[error("failed to read the columns of '{table_name}'")]
    Introspect {
        table_name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to create table '{table_name}'")]
    CreateTable {
        table_name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to copy data into '{table_name}'")]
    CopyData {
        table_name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to add primary key '{column}' to '{table_name}'")]
    AddPrimaryKey {
        table_name: String,
        column: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to add foreign key on '{table_name}.{column}'")]
    AddForeignKey {
        table_name: String,
        column: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to add column '{column}' to '{table_name}'")]
    AddColumn {
        table_name: String,
        column: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to create temporary table '{temp_table}' for '{table_name}'")]
    CreateTempTable {
        table_name: String,
        temp_table: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to merge '{temp_table}' into '{table_name}'")]
    Merge {
        table_name: String,
        temp_table: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to drop temporary table '{temp_table}'")]
    DropTempTable {
        temp_table: String,
        #[source]
        source: StoreError,
    },
}

/// Promote one datamart into the warehouse.
///
/// `stage_map` maps the `from` of every datamart of the stage processed so far (this one
/// included) to its `to`. It resolves the foreign keys of newly created tables.
#[tracing::instrument(skip_all, fields(from = %datamart.from_view, to = %datamart.to_view), err)]
pub async fn promote(
    store: &Store,
    cache: &mut SchemaCache,
    datamart: &Datamart,
    stage_map: &BTreeMap<String, String>,
    type_drift: TypeDriftPolicy,
) -> Result<Promotion, PromoteError> {
    let source = store
        .columns(Database::Raw, &datamart.from_view)
        .await
        .map_err(|err| PromoteError::Introspect {
            table_name: datamart.from_view.clone(),
            source: err,
        })?;
    if source.is_empty() {
        return Err(PromoteError::SourceNotFound {
            view: datamart.from_view.clone(),
        });
    }

    let target_exists = store
        .table_exists(Database::Warehouse, &datamart.to_view)
        .await
        .map_err(|err| PromoteError::Introspect {
            table_name: datamart.to_view.clone(),
            source: err,
        })?;

    let promotion = if target_exists {
        let target = store
            .columns(Database::Warehouse, &datamart.to_view)
            .await
            .map_err(|err| PromoteError::Introspect {
                table_name: datamart.to_view.clone(),
                source: err,
            })?;
        let protected = cache.protected_columns(&datamart.to_view);
        merge_into_existing(store, datamart, &source, &target, &protected, type_drift).await?
    } else {
        create_and_fill(store, datamart, &source, stage_map).await?
    };

    cache.invalidate(Database::Warehouse, &datamart.to_view);
    Ok(promotion)
}

async fn create_and_fill(
    store: &Store,
    datamart: &Datamart,
    source: &[ColumnInfo],
    stage_map: &BTreeMap<String, String>,
) -> Result<Promotion, PromoteError> {
    let table_name = datamart.to_view.as_str();
    let primary_key = plan_primary_key(source);
    let foreign_keys = plan_foreign_keys(table_name, source, stage_map)?;

    let mut conn = store
        .acquire(Database::Warehouse)
        .await
        .map_err(|err| PromoteError::CreateTable {
            table_name: table_name.to_string(),
            source: err,
        })?;

    store
        .execute_on(&mut conn, Database::Warehouse, &create_table_sql(table_name, source))
        .await
        .map_err(|err| PromoteError::CreateTable {
            table_name: table_name.to_string(),
            source: err,
        })?;

    let columns: Vec<&str> = source.iter().map(|column| column.name.as_str()).collect();
    let rows = store
        .copy_from_raw(
            &mut conn,
            &select_sql(&datamart.from_view, &columns),
            table_name,
            &columns,
        )
        .await
        .map_err(|err| PromoteError::CopyData {
            table_name: table_name.to_string(),
            source: err,
        })?;

    store
        .execute_on(
            &mut conn,
            Database::Warehouse,
            &primary_key_sql(table_name, &primary_key),
        )
        .await
        .map_err(|err| PromoteError::AddPrimaryKey {
            table_name: table_name.to_string(),
            column: primary_key.column().to_string(),
            source: err,
        })?;

    for foreign_key in &foreign_keys {
        store
            .execute_on(
                &mut conn,
                Database::Warehouse,
                &foreign_key_sql(table_name, foreign_key),
            )
            .await
            .map_err(|err| PromoteError::AddForeignKey {
                table_name: table_name.to_string(),
                column: foreign_key.column.clone(),
                source: err,
            })?;
    }

    tracing::info!(
        table = %table_name,
        columns = source.len(),
        rows,
        primary_key = %primary_key.column(),
        foreign_keys = foreign_keys.len(),
        "warehouse_table_created"
    );

    Ok(Promotion::Created {
        rows,
        primary_key,
        foreign_keys,
    })
}

async fn merge_into_existing(
    store: &Store,
    datamart: &Datamart,
    source: &[ColumnInfo],
    target: &[ColumnInfo],
    protected: &BTreeSet<String>,
    type_drift: TypeDriftPolicy,
) -> Result<Promotion, PromoteError> {
    let table_name = datamart.to_view.as_str();

    let drifts = detect_drift(source, target);
    if !drifts.is_empty() {
        match type_drift {
            TypeDriftPolicy::Reject => {
                return Err(PromoteError::SchemaDrift {
                    table_name: table_name.to_string(),
                    drifts,
                });
            }
            TypeDriftPolicy::Ignore => {
                for drift in &drifts {
                    tracing::warn!(
                        table = %table_name,
                        column = %drift.column,
                        warehouse_type = %drift.warehouse_type,
                        source_type = %drift.source_type,
                        "column_type_drift_ignored"
                    );
                }
            }
        }
    }

    let temp_table = format!("{TEMP_TABLE_PREFIX}{table_name}");
    validate_identifier(&temp_table).map_err(|err| PromoteError::InvalidIdentifier {
        name: temp_table.clone(),
        source: err,
    })?;

    let mut added_columns = Vec::new();
    for column in columns_to_add(source, target, protected) {
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            ident(table_name),
            ident(&column.name),
            column.data_type
        );
        store
            .execute(Database::Warehouse, &ddl)
            .await
            .map_err(|err| PromoteError::AddColumn {
                table_name: table_name.to_string(),
                column: column.name.clone(),
                source: err,
            })?;
        tracing::info!(table = %table_name, column = %column.name, "warehouse_column_added");
        added_columns.push(column.name.clone());
    }

    let target_names: BTreeSet<&str> = target
        .iter()
        .map(|column| column.name.as_str())
        .chain(added_columns.iter().map(String::as_str))
        .collect();
    let shared: Vec<&ColumnInfo> = source
        .iter()
        .filter(|column| target_names.contains(column.name.as_str()))
        .collect();
    let primary_key = target
        .iter()
        .find(|column| column.is_primary_key)
        .map(|column| column.name.as_str())
        .filter(|pk| shared.iter().any(|column| column.name == *pk));

    let mut conn = store
        .acquire(Database::Warehouse)
        .await
        .map_err(|err| PromoteError::CreateTempTable {
            table_name: table_name.to_string(),
            temp_table: temp_table.clone(),
            source: err,
        })?;

    let merged = copy_and_merge(
        store,
        &mut conn,
        datamart,
        &temp_table,
        &shared,
        &drifts,
        primary_key,
    )
    .await;

    let dropped = store
        .execute_on(
            &mut conn,
            Database::Warehouse,
            &format!("DROP TABLE IF EXISTS {}", ident(&temp_table)),
        )
        .await;

    let rows = match (merged, dropped) {
        (Ok(rows), Ok(())) => rows,
        (Ok(_), Err(err)) => {
            return Err(PromoteError::DropTempTable {
                temp_table,
                source: err,
            });
        }
        (Err(err), Ok(())) => return Err(err),
        (Err(err), Err(drop_err)) => {
            tracing::warn!(
                temp_table = %temp_table,
                error = %drop_err,
                error_source = monitoring::logging::error_source(&drop_err),
                "temp_table_drop_failed"
            );
            return Err(err);
        }
    };

    tracing::info!(
        table = %table_name,
        rows,
        added_columns = added_columns.len(),
        upsert = primary_key.is_some(),
        "warehouse_table_merged"
    );

    Ok(Promotion::Merged {
        rows,
        added_columns,
        upsert: primary_key.is_some(),
    })
}

async fn copy_and_merge(
    store: &Store,
    conn: &mut PgConnection,
    datamart: &Datamart,
    temp_table: &str,
    shared: &[&ColumnInfo],
    drifts: &[TypeDrift],
    primary_key: Option<&str>,
) -> Result<u64, PromoteError> {
    let table_name = datamart.to_view.as_str();

    let columns_ddl = shared
        .iter()
        .map(|column| format!("{} {}", ident(&column.name), column.data_type))
        .collect::<Vec<_>>()
        .join(", ");
    let create_temp = format!(
        "DROP TABLE IF EXISTS {temp}; CREATE TEMPORARY TABLE {temp} ({columns_ddl})",
        temp = ident(temp_table),
    );
    store
        .execute_on(conn, Database::Warehouse, &create_temp)
        .await
        .map_err(|err| PromoteError::CreateTempTable {
            table_name: table_name.to_string(),
            temp_table: temp_table.to_string(),
            source: err,
        })?;

    let columns: Vec<&str> = shared.iter().map(|column| column.name.as_str()).collect();
    let rows = store
        .copy_from_raw(
            conn,
            &select_sql(&datamart.from_view, &columns),
            temp_table,
            &columns,
        )
        .await
        .map_err(|err| PromoteError::CopyData {
            table_name: temp_table.to_string(),
            source: err,
        })?;

    let casts: BTreeMap<&str, &str> = drifts
        .iter()
        .map(|drift| (drift.column.as_str(), drift.warehouse_type.as_str()))
        .collect();
    store
        .execute_on(
            conn,
            Database::Warehouse,
            &merge_sql(table_name, temp_table, &columns, &casts, primary_key),
        )
        .await
        .map_err(|err| PromoteError::Merge {
            table_name: table_name.to_string(),
            temp_table: temp_table.to_string(),
            source: err,
        })?;

    Ok(rows)
}

/// Use the source's first primary key column, or fabricate `id` (`_id` when `id` is taken).
pub fn plan_primary_key(source: &[ColumnInfo]) -> PrimaryKeyPlan {
    if let Some(column) = source.iter().find(|column| column.is_primary_key) {
        return PrimaryKeyPlan::Natural(column.name.clone());
    }
    if source.iter().any(|column| column.name == "id") {
        PrimaryKeyPlan::Surrogate("_id".to_string())
    } else {
        PrimaryKeyPlan::Surrogate("id".to_string())
    }
}

/// Map every source foreign key onto the warehouse table promoted from the referenced table.
pub fn plan_foreign_keys(
    table_name: &str,
    source: &[ColumnInfo],
    stage_map: &BTreeMap<String, String>,
) -> Result<Vec<ForeignKeyPlan>, PromoteError> {
    let mut plans = Vec::new();
    for column in source {
        let Some((references_table, references_column)) = column.foreign_key() else {
            continue;
        };
        let target = stage_map.get(references_table).ok_or_else(|| {
            PromoteError::UnresolvedForeignKey {
                table_name: table_name.to_string(),
                column: column.name.clone(),
                references_table: references_table.to_string(),
            }
        })?;

        let constraint = format!("fk_{}", column.name);
        validate_identifier(&constraint).map_err(|err| PromoteError::InvalidIdentifier {
            name: constraint.clone(),
            source: err,
        })?;

        plans.push(ForeignKeyPlan {
            constraint,
            column: column.name.clone(),
            references_table: target.clone(),
            references_column: references_column.to_string(),
        });
    }
    Ok(plans)
}

/// Same-name columns whose types differ, in source order.
pub fn detect_drift(source: &[ColumnInfo], target: &[ColumnInfo]) -> Vec<TypeDrift> {
    let target_types: BTreeMap<&str, &str> = target
        .iter()
        .map(|column| (column.name.as_str(), column.data_type.as_str()))
        .collect();
    source
        .iter()
        .filter_map(|column| {
            let warehouse_type = target_types.get(column.name.as_str())?;
            (*warehouse_type != column.data_type).then(|| TypeDrift {
                column: column.name.clone(),
                warehouse_type: warehouse_type.to_string(),
                source_type: column.data_type.clone(),
            })
        })
        .collect()
}

/// Source columns missing from the target that are not protected.
pub fn columns_to_add<'a>(
    source: &'a [ColumnInfo],
    target: &[ColumnInfo],
    protected: &BTreeSet<String>,
) -> Vec<&'a ColumnInfo> {
    let existing: BTreeSet<&str> = target.iter().map(|column| column.name.as_str()).collect();
    source
        .iter()
        .filter(|column| {
            !existing.contains(column.name.as_str()) && !protected.contains(&column.name)
        })
        .collect()
}

fn select_sql(from_view: &str, columns: &[&str]) -> String {
    format!(
        "SELECT {} FROM {}",
        ident_list(columns.iter().copied()),
        ident(from_view)
    )
}

pub fn create_table_sql(table_name: &str, columns: &[ColumnInfo]) -> String {
    let definitions = columns
        .iter()
        .map(|column| format!("{} {}", ident(&column.name), column.data_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({definitions})", ident(table_name))
}

pub fn primary_key_sql(table_name: &str, primary_key: &PrimaryKeyPlan) -> String {
    let table = ident(table_name);
    match primary_key {
        PrimaryKeyPlan::Natural(column) => {
            let column = ident(column);
            format!(
                "ALTER TABLE {table} ALTER COLUMN {column} SET NOT NULL; ALTER TABLE {table} ADD PRIMARY KEY ({column})"
            )
        }
        PrimaryKeyPlan::Surrogate(column) => {
            format!(
                "ALTER TABLE {table} ADD COLUMN {} SERIAL PRIMARY KEY",
                ident(column)
            )
        }
    }
}

pub fn foreign_key_sql(table_name: &str, foreign_key: &ForeignKeyPlan) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        ident(table_name),
        ident(&foreign_key.constraint),
        ident(&foreign_key.column),
        ident(&foreign_key.references_table),
        ident(&foreign_key.references_column)
    )
}

/// `INSERT ... SELECT` from the temporary table, as an upsert when `primary_key` is set.
///
/// `casts` maps drifting columns to the warehouse type they are converted to.
pub fn merge_sql(
    table_name: &str,
    temp_table: &str,
    columns: &[&str],
    casts: &BTreeMap<&str, &str>,
    primary_key: Option<&str>,
) -> String {
    let selected = columns
        .iter()
        .map(|column| match casts.get(column) {
            Some(data_type) => format!("{}::{data_type}", ident(column)),
            None => ident(column).into_owned(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {selected} FROM {}",
        ident(table_name),
        ident_list(columns.iter().copied()),
        ident(temp_table)
    );

    if let Some(pk) = primary_key {
        let updates: Vec<String> = columns
            .iter()
            .filter(|column| **column != pk)
            .map(|column| format!("{0} = EXCLUDED.{0}", ident(column)))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", ident(pk)));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                ident(pk),
                updates.join(", ")
            ));
        }
    }
    sql
}
