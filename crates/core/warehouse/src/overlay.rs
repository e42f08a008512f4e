//! Overlay views: the current state of a warehouse table with its logged edits applied.
//!
//! For a table `T` with primary key `pk`, the view `view_T` keeps one winning log entry per
//! `(target_id, target_column)`, the newest by `(created_at, id)`. It then:
//!
//! - drops every row whose `pk` has a winning `delete` entry,
//! - projects `pk` unchanged,
//! - projects each other column `c` as `COALESCE(<winning value of c cast to c's type>, r.c)`.
//!
//! The view is recreated from scratch each time and is never maintained incrementally.

use staging::sql::{ValidateIdentifierError, ident, literal, validate_identifier};

use crate::{store::ColumnInfo, txn_log::overlay_view_name};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayError {
    /// Edits are keyed by primary key, so a table without one cannot be overlaid
    #[error("table '{table_name}' has no primary key and cannot receive an overlay view")]
    MissingPrimaryKey { table_name: String },

    #[error("invalid overlay view name '{name}'")]
    InvalidViewName {
        name: String,
        #[source]
        source: ValidateIdentifierError,
    },
}

/// Build the `DROP VIEW ...; CREATE VIEW ...` script of the overlay of `table`.
///
/// `columns` is the table's schema in ordinal order.
pub fn overlay_view_sql(
    table: &str,
    log_table: &str,
    columns: &[ColumnInfo],
) -> Result<String, OverlayError> {
    let primary_key = columns
        .iter()
        .find(|column| column.is_primary_key)
        .ok_or_else(|| OverlayError::MissingPrimaryKey {
            table_name: table.to_string(),
        })?;

    let view_name = overlay_view_name(table);
    validate_identifier(&view_name).map_err(|err| OverlayError::InvalidViewName {
        name: view_name.clone(),
        source: err,
    })?;

    let pk = ident(&primary_key.name);
    let mut projections = vec![format!("r.{pk}")];
    let mut joins = Vec::new();

    for (index, column) in columns
        .iter()
        .filter(|column| column.name != primary_key.name)
        .enumerate()
    {
        let alias = format!("w{index}");
        let name = ident(&column.name);
        let cast = if column.data_type.eq_ignore_ascii_case("text") {
            String::new()
        } else {
            format!("::{}", column.data_type)
        };

        projections.push(format!(
            "COALESCE({alias}.new_value{cast}, r.{name}) AS {name}"
        ));
        joins.push(format!(
            "LEFT JOIN winning_entries {alias}\n    ON r.{pk}::text = {alias}.target_id::text\n    AND {alias}.target_column = {}\n    AND {alias}.action <> 'delete'",
            literal(&column.name)
        ));
    }

    let mut sql = indoc::formatdoc! {r#"
        DROP VIEW IF EXISTS {view} CASCADE;
        CREATE VIEW {view} AS
        WITH latest_entries AS (
            SELECT
                target_id,
                target_column,
                new_value,
                action,
                ROW_NUMBER() OVER (
                    PARTITION BY target_id, target_column
                    ORDER BY created_at DESC NULLS LAST, id DESC
                ) AS rn
            FROM {log}
            WHERE UPPER(target_table) = UPPER({table_literal})
        ),
        winning_entries AS (
            SELECT target_id, target_column, new_value, action
            FROM latest_entries
            WHERE rn = 1
        )
        SELECT
            {projections}
        FROM {table} r
        "#,
        view = ident(&view_name),
        log = ident(log_table),
        table_literal = literal(table),
        projections = projections.join(",\n    "),
        table = ident(table),
    };
    for join in joins {
        sql.push_str(&join);
        sql.push('\n');
    }
    sql.push_str(&indoc::formatdoc! {r#"
        WHERE NOT EXISTS (
            SELECT 1
            FROM winning_entries wd
            WHERE r.{pk}::text = wd.target_id::text
              AND wd.action = 'delete'
        )"#,
        pk = pk,
    });

    Ok(sql)
}
