//! Catalog queries shared by both stores

use sqlx::{Executor, Postgres};
use staging::sql::ident;

use super::ColumnInfo;

/// List the base tables of the `public` schema, in name order
pub async fn list_tables<'c, E>(exe: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT table_name::text
        FROM information_schema.tables
        WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
        ORDER BY table_name
    "#};
    sqlx::query_scalar(query).fetch_all(exe).await
}

/// List the views of the `public` schema, in name order
pub async fn list_views<'c, E>(exe: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT table_name::text
        FROM information_schema.views
        WHERE table_schema = 'public'
        ORDER BY table_name
    "#};
    sqlx::query_scalar(query).fetch_all(exe).await
}

/// Check whether a base table or a view with the given name exists in `public`
pub async fn relation_exists<'c, E>(exe: E, name: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT EXISTS (
            SELECT 1
            FROM information_schema.tables
            WHERE table_schema = 'public'
              AND table_name = $1
              AND table_type IN ('BASE TABLE', 'VIEW')
        )
    "#};
    sqlx::query_scalar(query).bind(name).fetch_one(exe).await
}

/// Check whether a base table with the given name exists in `public`
pub async fn table_exists<'c, E>(exe: E, name: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT EXISTS (
            SELECT 1
            FROM information_schema.tables
            WHERE table_schema = 'public'
              AND table_name = $1
              AND table_type = 'BASE TABLE'
        )
    "#};
    sqlx::query_scalar(query).bind(name).fetch_one(exe).await
}

/// Check whether a relation holds at least one row
///
/// `name` must be a validated identifier.
pub async fn has_rows<'c, E>(exe: E, name: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!("SELECT EXISTS (SELECT 1 FROM {})", ident(name));
    sqlx::query_scalar(&query).fetch_one(exe).await
}

/// Describe the columns of a table or view, in ordinal order
///
/// Types are rendered with `format_type`, so they can be spliced back into DDL as-is.
/// Views never report key constraints.
pub async fn columns<'c, E>(exe: E, name: &str) -> Result<Vec<ColumnInfo>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT
            a.attname::text AS name,
            format_type(a.atttypid, a.atttypmod) AS data_type,
            EXISTS (
                SELECT 1
                FROM pg_catalog.pg_constraint pk
                WHERE pk.conrelid = c.oid
                  AND pk.contype = 'p'
                  AND a.attnum = ANY (pk.conkey)
            ) AS is_primary_key,
            fk.references_table,
            fk.references_column
        FROM pg_catalog.pg_attribute a
        JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN LATERAL (
            SELECT
                rc.relname::text AS references_table,
                ra.attname::text AS references_column
            FROM pg_catalog.pg_constraint con
            JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid
            JOIN pg_catalog.pg_attribute ra
              ON ra.attrelid = con.confrelid
             AND ra.attnum = con.confkey[array_position(con.conkey, a.attnum)]
            WHERE con.conrelid = c.oid
              AND con.contype = 'f'
              AND a.attnum = ANY (con.conkey)
            ORDER BY con.conname
            LIMIT 1
        ) fk ON true
        WHERE n.nspname = 'public'
          AND c.relname = $1
          AND a.attnum > 0
          AND NOT a.attisdropped
        ORDER BY a.attnum
    "#};
    sqlx::query_as(query).bind(name).fetch_all(exe).await
}

/// Run a single read query and return each row as a JSON object
///
/// `statement` must be one `SELECT`-like statement without a trailing semicolon.
pub async fn query_json<'c, E>(
    exe: E,
    statement: &str,
) -> Result<Vec<serde_json::Value>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!("SELECT row_to_json(q) FROM ({statement}) AS q");
    sqlx::query_scalar(&query).fetch_all(exe).await
}
