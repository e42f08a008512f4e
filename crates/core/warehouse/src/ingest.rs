//! Raw ingestion of JSON rows.
//!
//! Rows are JSON objects keyed by column name. Every row of a call must carry the same keys.
//! Column types are either all `text`, or inferred from the values when inference is enabled.
//! Values are always bound as text parameters and cast in SQL to the column type.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use staging::sql::{ValidateIdentifierError, ident, ident_list, validate_identifier};

use crate::{
    cache::SchemaCache,
    store::{ColumnInfo, Database, Store, StoreError},
};

/// One row to ingest.
pub type Row = serde_json::Map<String, Value>;

/// PostgreSQL caps a statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// SQLSTATE `duplicate_table`.
const DUPLICATE_TABLE: &str = "42P07";

/// Column type of ingested data, spelled the way `format_type` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Boolean,
    DoublePrecision,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::DoublePrecision => "double precision",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ValueKind {
    Boolean,
    Integer,
    Float,
    Text,
}

fn value_kind(value: &Value) -> Option<ValueKind> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ValueKind::Boolean),
        Value::Number(number) if number.is_f64() => Some(ValueKind::Float),
        Value::Number(_) => Some(ValueKind::Integer),
        Value::String(text) => Some(string_kind(text)),
        Value::Array(_) | Value::Object(_) => Some(ValueKind::Text),
    }
}

fn string_kind(text: &str) -> ValueKind {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
        ValueKind::Boolean
    } else if trimmed.parse::<i64>().is_ok() {
        ValueKind::Integer
    } else if trimmed.parse::<f64>().is_ok_and(f64::is_finite) {
        ValueKind::Float
    } else {
        ValueKind::Text
    }
}

/// Infer the type of one column from its values. `None` when every value is null.
fn infer_column(values: impl IntoIterator<Item = Option<ValueKind>>) -> Option<ColumnType> {
    let kinds: BTreeSet<ValueKind> = values.into_iter().flatten().collect();
    if kinds.is_empty() {
        return None;
    }
    let numeric = kinds
        .iter()
        .all(|kind| matches!(kind, ValueKind::Integer | ValueKind::Float));
    Some(if numeric {
        ColumnType::DoublePrecision
    } else if kinds.len() == 1 && kinds.contains(&ValueKind::Boolean) {
        ColumnType::Boolean
    } else {
        ColumnType::Text
    })
}

/// Infer column types of consistent `rows`.
///
/// Columns holding only nulls map to `None`.
pub fn infer_types(rows: &[Row], infer: bool) -> BTreeMap<String, Option<ColumnType>> {
    let Some(first) = rows.first() else {
        return BTreeMap::new();
    };
    first
        .keys()
        .map(|column| {
            let kinds = rows
                .iter()
                .map(|row| row.get(column).and_then(value_kind));
            let inferred = infer_column(kinds);
            let column_type = if infer {
                inferred
            } else {
                inferred.map(|_| ColumnType::Text)
            };
            (column.clone(), column_type)
        })
        .collect()
}

/// A column whose inferred type differs from the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub column: String,
    pub expected: String,
    pub found: String,
}

/// Errors that can occur during raw ingestion.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid table name '{table_name}'")]
    InvalidTableName {
        table_name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    #[error("invalid column name '{column}'")]
    InvalidColumnName {
        column: String,
        #[source]
        source: ValidateIdentifierError,
    },

    #[error("no rows given for table '{table_name}'")]
    EmptyRows { table_name: String },

    /// A row's keys differ from the first row's keys
    #[error(
        "row {row} of '{table_name}' has a different set of columns (missing: {missing_columns:?}, extra: {extra_columns:?})"
    )]
    InconsistentRows {
        table_name: String,
        row: usize,
        missing_columns: Vec<String>,
        extra_columns: Vec<String>,
    },

    #[error("primary key '{column}' is not a column of '{table_name}'")]
    UnknownPrimaryKey { table_name: String, column: String },

    #[error("raw table '{table_name}' does not exist")]
    TableNotFound { table_name: String },

    /// The rows do not match the stored table structure
    #[error(
        "rows do not match the structure of '{table_name}' (missing: {missing_columns:?}, extra: {extra_columns:?}, type mismatches: {type_mismatches:?})"
    )]
    SchemaInconsistency {
        table_name: String,
        missing_columns: Vec<String>,
        extra_columns: Vec<String>,
        type_mismatches: Vec<TypeMismatch>,
    },

    #[error("failed to write raw table '{table_name}'")]
    Store {
        table_name: String,
        #[source]
        source: StoreError,
    },
}

/// Ingestion switches taken from the pipeline configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    pub infer_types: bool,
    pub drop_table_if_exists: bool,
}

/// Create raw table `table_name` from `rows` and insert them.
///
/// Returns the number of inserted rows.
#[tracing::instrument(skip_all, fields(table = %table_name), err)]
pub async fn create_table(
    store: &Store,
    cache: &mut SchemaCache,
    options: IngestOptions,
    table_name: &str,
    rows: &[Row],
    primary_key: Option<&str>,
) -> Result<u64, IngestError> {
    validate_identifier(table_name).map_err(|err| IngestError::InvalidTableName {
        table_name: table_name.to_string(),
        source: err,
    })?;
    let columns = check_rows(table_name, rows)?;
    if let Some(pk) = primary_key.filter(|pk| !columns.iter().any(|column| column.as_str() == *pk)) {
        return Err(IngestError::UnknownPrimaryKey {
            table_name: table_name.to_string(),
            column: pk.to_string(),
        });
    }

    let types = infer_types(rows, options.infer_types);
    let column_types: Vec<(String, ColumnType)> = columns
        .iter()
        .map(|column| {
            let column_type = types
                .get(column)
                .copied()
                .flatten()
                .unwrap_or(ColumnType::Text);
            (column.clone(), column_type)
        })
        .collect();

    let ddl = create_table_sql(table_name, &column_types, primary_key);
    let store_err = |err: StoreError| IngestError::Store {
        table_name: table_name.to_string(),
        source: err,
    };

    match store.execute(Database::Raw, &ddl).await {
        Ok(()) => {}
        Err(err)
            if options.drop_table_if_exists && err.code().as_deref() == Some(DUPLICATE_TABLE) =>
        {
            tracing::info!(table = %table_name, "raw_table_recreated");
            let drop = format!("DROP TABLE {} CASCADE", ident(table_name));
            store.execute(Database::Raw, &drop).await.map_err(store_err)?;
            store.execute(Database::Raw, &ddl).await.map_err(store_err)?;
        }
        Err(err) => return Err(store_err(err)),
    }
    cache.invalidate(Database::Raw, table_name);

    let inserted = insert_rows(store, table_name, &column_types, rows)
        .await
        .map_err(store_err)?;
    tracing::info!(
        table = %table_name,
        columns = column_types.len(),
        rows = inserted,
        "raw_table_created"
    );
    Ok(inserted)
}

/// Insert `rows` into the existing raw table `table_name`.
///
/// The rows must carry exactly the table's columns, with compatible inferred types.
#[tracing::instrument(skip_all, fields(table = %table_name), err)]
pub async fn insert(
    store: &Store,
    cache: &mut SchemaCache,
    options: IngestOptions,
    table_name: &str,
    rows: &[Row],
) -> Result<u64, IngestError> {
    validate_identifier(table_name).map_err(|err| IngestError::InvalidTableName {
        table_name: table_name.to_string(),
        source: err,
    })?;
    let store_err = |err: StoreError| IngestError::Store {
        table_name: table_name.to_string(),
        source: err,
    };

    let cached = cache.schema(Database::Raw, table_name).map(<[ColumnInfo]>::to_vec);
    let from_cache = cached.is_some();
    let schema = match cached {
        Some(schema) => schema,
        None => read_raw_schema(store, cache, table_name).await?,
    };

    let columns = check_rows(table_name, rows)?;
    let inferred = infer_types(rows, options.infer_types);

    // The memo may predate DDL run outside this module; re-read once before rejecting.
    let schema = match check_schema(table_name, &schema, &inferred) {
        Ok(()) => schema,
        Err(_) if from_cache => {
            cache.invalidate(Database::Raw, table_name);
            let fresh = read_raw_schema(store, cache, table_name).await?;
            check_schema(table_name, &fresh, &inferred)?;
            fresh
        }
        Err(err) => return Err(err),
    };
    let stored: BTreeMap<&str, &str> = schema
        .iter()
        .map(|column| (column.name.as_str(), column.data_type.as_str()))
        .collect();

    let column_types: Vec<(String, ColumnType)> = columns
        .into_iter()
        .map(|column| {
            let column_type = match stored.get(column.as_str()) {
                Some(&"boolean") => ColumnType::Boolean,
                Some(&"double precision") => ColumnType::DoublePrecision,
                _ => ColumnType::Text,
            };
            (column, column_type)
        })
        .collect();

    let inserted = match insert_rows(store, table_name, &column_types, rows).await {
        Ok(inserted) => inserted,
        Err(err) => {
            cache.invalidate(Database::Raw, table_name);
            return Err(store_err(err));
        }
    };
    tracing::info!(table = %table_name, rows = inserted, "raw_rows_inserted");
    Ok(inserted)
}

/// Introspect raw table `table_name` and memoize its columns. A missing table is an error.
async fn read_raw_schema(
    store: &Store,
    cache: &mut SchemaCache,
    table_name: &str,
) -> Result<Vec<ColumnInfo>, IngestError> {
    let schema = store
        .columns(Database::Raw, table_name)
        .await
        .map_err(|err| IngestError::Store {
            table_name: table_name.to_string(),
            source: err,
        })?;
    if schema.is_empty() {
        return Err(IngestError::TableNotFound {
            table_name: table_name.to_string(),
        });
    }
    cache.store_schema(Database::Raw, table_name, schema.clone());
    Ok(schema)
}

/// Compare inferred row types with the stored columns of `table_name`.
fn check_schema(
    table_name: &str,
    schema: &[ColumnInfo],
    inferred: &BTreeMap<String, Option<ColumnType>>,
) -> Result<(), IngestError> {
    let stored: BTreeMap<&str, &str> = schema
        .iter()
        .map(|column| (column.name.as_str(), column.data_type.as_str()))
        .collect();

    let missing_columns: Vec<String> = stored
        .keys()
        .filter(|name| !inferred.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    let extra_columns: Vec<String> = inferred
        .keys()
        .filter(|name| !stored.contains_key(name.as_str()))
        .cloned()
        .collect();
    let type_mismatches: Vec<TypeMismatch> = inferred
        .iter()
        .filter_map(|(name, found)| {
            let expected = stored.get(name.as_str())?;
            let found = (*found)?;
            (found.as_sql() != *expected).then(|| TypeMismatch {
                column: name.clone(),
                expected: expected.to_string(),
                found: found.as_sql().to_string(),
            })
        })
        .collect();

    if missing_columns.is_empty() && extra_columns.is_empty() && type_mismatches.is_empty() {
        return Ok(());
    }
    Err(IngestError::SchemaInconsistency {
        table_name: table_name.to_string(),
        missing_columns,
        extra_columns,
        type_mismatches,
    })
}

/// Check that `rows` is non-empty and consistently keyed, returning the column names.
fn check_rows(table_name: &str, rows: &[Row]) -> Result<Vec<String>, IngestError> {
    let Some(first) = rows.first() else {
        return Err(IngestError::EmptyRows {
            table_name: table_name.to_string(),
        });
    };
    let columns: Vec<String> = first.keys().cloned().collect();
    for column in &columns {
        validate_identifier(column).map_err(|err| IngestError::InvalidColumnName {
            column: column.clone(),
            source: err,
        })?;
    }

    let expected: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
    for (index, row) in rows.iter().enumerate().skip(1) {
        let found: BTreeSet<&str> = row.keys().map(String::as_str).collect();
        if found != expected {
            return Err(IngestError::InconsistentRows {
                table_name: table_name.to_string(),
                row: index,
                missing_columns: expected.difference(&found).map(|c| c.to_string()).collect(),
                extra_columns: found.difference(&expected).map(|c| c.to_string()).collect(),
            });
        }
    }
    Ok(columns)
}

fn create_table_sql(
    table_name: &str,
    columns: &[(String, ColumnType)],
    primary_key: Option<&str>,
) -> String {
    let definitions = columns
        .iter()
        .map(|(name, column_type)| {
            let key = if primary_key == Some(name.as_str()) {
                " PRIMARY KEY"
            } else {
                ""
            };
            format!("{} {}{key}", ident(name), column_type.as_sql())
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({definitions})", ident(table_name))
}

/// Text rendering of a JSON value for a text bind parameter.
fn bind_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

async fn insert_rows(
    store: &Store,
    table_name: &str,
    columns: &[(String, ColumnType)],
    rows: &[Row],
) -> Result<u64, StoreError> {
    let rows_per_statement = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
    let column_names = ident_list(columns.iter().map(|(name, _)| name.as_str()));

    let mut inserted = 0;
    for chunk in rows.chunks(rows_per_statement) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({column_names}) ",
            ident(table_name)
        ));
        builder.push_values(chunk, |mut values, row| {
            for (name, column_type) in columns {
                values
                    .push_bind(bind_text(row.get(name)))
                    .push_unseparated(format!("::{}", column_type.as_sql()));
            }
        });

        let result = store
            .guard(
                Database::Raw,
                "insert rows",
                builder.build().execute(store.pool(Database::Raw)),
            )
            .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    mod it_ingest;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn rows(value: Value) -> Vec<Row> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    #[test]
    fn infer_types_merges_value_kinds() {
        //* Given
        let rows = rows(json!([
            {"active": "TRUE", "credits": 3, "title": "Algebra", "mixed": 1, "empty": null},
            {"active": false, "credits": "4.5", "title": "7", "mixed": "yes", "empty": null},
        ]));

        //* When
        let inferred = infer_types(&rows, true);

        //* Then
        assert_eq!(
            inferred,
            BTreeMap::from([
                ("active".to_string(), Some(ColumnType::Boolean)),
                ("credits".to_string(), Some(ColumnType::DoublePrecision)),
                ("empty".to_string(), None),
                ("mixed".to_string(), Some(ColumnType::Text)),
                ("title".to_string(), Some(ColumnType::Text)),
            ])
        );
    }

    #[test]
    fn infer_types_without_inference_is_all_text() {
        let rows = rows(json!([{"active": true, "credits": 3, "empty": null}]));

        let inferred = infer_types(&rows, false);

        assert_eq!(
            inferred,
            BTreeMap::from([
                ("active".to_string(), Some(ColumnType::Text)),
                ("credits".to_string(), Some(ColumnType::Text)),
                ("empty".to_string(), None),
            ])
        );
    }

    #[test]
    fn string_kind_does_not_treat_nan_as_a_number() {
        assert_eq!(string_kind("NaN"), ValueKind::Text);
        assert_eq!(string_kind("inf"), ValueKind::Text);
        assert_eq!(string_kind(" 12 "), ValueKind::Integer);
        assert_eq!(string_kind("1e3"), ValueKind::Float);
    }

    #[test]
    fn check_rows_reports_inconsistent_keys() {
        //* Given
        let rows = rows(json!([
            {"id": 1, "title": "a"},
            {"id": 2, "label": "b"},
        ]));

        //* When
        let result = check_rows("courses", &rows);

        //* Then
        assert!(matches!(
            result,
            Err(IngestError::InconsistentRows { row: 1, missing_columns, extra_columns, .. })
                if missing_columns == vec!["title"] && extra_columns == vec!["label"]
        ));
    }

    #[test]
    fn check_rows_rejects_empty_input_and_bad_names() {
        assert!(matches!(
            check_rows("courses", &[]),
            Err(IngestError::EmptyRows { .. })
        ));
        assert!(matches!(
            check_rows("courses", &rows(json!([{"bad name": 1}]))),
            Err(IngestError::InvalidColumnName { .. })
        ));
    }

    #[test]
    fn create_table_sql_marks_the_primary_key() {
        let sql = create_table_sql(
            "courses",
            &[
                ("code".to_string(), ColumnType::Text),
                ("credits".to_string(), ColumnType::DoublePrecision),
            ],
            Some("code"),
        );

        assert_eq!(
            sql,
            "CREATE TABLE courses (code text PRIMARY KEY, credits double precision)"
        );
    }

    #[test]
    fn bind_text_renders_json_scalars() {
        assert_eq!(bind_text(Some(&json!("x"))), Some("x".to_string()));
        assert_eq!(bind_text(Some(&json!(2.5))), Some("2.5".to_string()));
        assert_eq!(bind_text(Some(&json!(true))), Some("true".to_string()));
        assert_eq!(bind_text(Some(&Value::Null)), None);
        assert_eq!(bind_text(None), None);
    }
}
