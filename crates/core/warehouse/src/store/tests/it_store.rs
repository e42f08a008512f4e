//! Store introspection, query and copy tests

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use crate::{
    store::{ColumnInfo, Database, StoreError},
    test_utils::TempStores,
};

#[tokio::test]
async fn columns_report_types_and_keys_in_ordinal_order() {
    //* Given
    let stores = TempStores::new().await;
    stores
        .exec(
            Database::Raw,
            r#"
            CREATE TABLE raw_programs (code VARCHAR(10) PRIMARY KEY, title TEXT);
            CREATE TABLE raw_students (
                id INTEGER PRIMARY KEY,
                program_code VARCHAR(10) REFERENCES raw_programs (code),
                gpa DOUBLE PRECISION
            );
            "#,
        )
        .await;

    //* When
    let columns = stores
        .store
        .columns(Database::Raw, "raw_students")
        .await
        .expect("Failed to describe columns");

    //* Then
    assert_eq!(
        columns,
        vec![
            ColumnInfo {
                name: "id".into(),
                data_type: "integer".into(),
                is_primary_key: true,
                references_table: None,
                references_column: None,
            },
            ColumnInfo {
                name: "program_code".into(),
                data_type: "character varying(10)".into(),
                is_primary_key: false,
                references_table: Some("raw_programs".into()),
                references_column: Some("code".into()),
            },
            ColumnInfo {
                name: "gpa".into(),
                data_type: "double precision".into(),
                is_primary_key: false,
                references_table: None,
                references_column: None,
            },
        ]
    );
}

#[tokio::test]
async fn tables_views_and_existence_checks() {
    //* Given
    let stores = TempStores::new().await;
    stores
        .exec(
            Database::Warehouse,
            "CREATE TABLE rooms (id INTEGER); CREATE VIEW big_rooms AS SELECT id FROM rooms",
        )
        .await;
    let store = &stores.store;

    //* When
    let tables = store.tables(Database::Warehouse).await.expect("tables");
    let views = store.views(Database::Warehouse).await.expect("views");

    //* Then
    assert_eq!(tables, vec!["rooms"]);
    assert_eq!(views, vec!["big_rooms"]);
    assert!(store.relation_exists(Database::Warehouse, "big_rooms").await.expect("exists"));
    assert!(!store.table_exists(Database::Warehouse, "big_rooms").await.expect("exists"));
    assert!(!store.has_rows(Database::Warehouse, "rooms").await.expect("has rows"));
    assert!(store.tables(Database::Raw).await.expect("tables").is_empty());
}

#[tokio::test]
async fn query_returns_rows_as_json_objects() {
    //* Given
    let stores = TempStores::new().await;
    stores
        .exec(
            Database::Raw,
            "CREATE TABLE courses (id INTEGER, title TEXT); INSERT INTO courses VALUES (1, 'Algebra'), (2, NULL)",
        )
        .await;

    //* When
    let rows = stores
        .rows(Database::Raw, "SELECT id, title FROM courses ORDER BY id;")
        .await;

    //* Then
    assert_eq!(
        rows,
        vec![
            json!({"id": 1, "title": "Algebra"}),
            json!({"id": 2, "title": null}),
        ]
    );
}

#[tokio::test]
async fn query_rejects_statements_that_are_not_reads() {
    let stores = TempStores::new().await;

    let result = stores
        .store
        .query(Database::Raw, "CREATE TABLE sneaky (id INTEGER)")
        .await;

    assert!(matches!(result, Err(StoreError::WrongQueryType { .. })));
}

#[tokio::test]
async fn failed_statements_keep_the_server_error_code() {
    let stores = TempStores::new().await;
    stores.exec(Database::Raw, "CREATE TABLE twice (id INTEGER)").await;

    let err = stores
        .store
        .execute(Database::Raw, "CREATE TABLE twice (id INTEGER)")
        .await
        .expect_err("table already exists");

    assert_eq!(err.code().as_deref(), Some("42P07"));
}

#[tokio::test]
async fn copy_from_raw_streams_rows_into_the_warehouse() {
    //* Given
    let stores = TempStores::new().await;
    stores
        .exec(
            Database::Raw,
            r#"
            CREATE TABLE raw_courses (id INTEGER, title TEXT);
            INSERT INTO raw_courses SELECT n, 'course ' || n FROM generate_series(1, 500) AS n;
            "#,
        )
        .await;
    stores
        .exec(Database::Warehouse, "CREATE TABLE courses (id INTEGER, title TEXT)")
        .await;
    let mut conn = stores
        .store
        .acquire(Database::Warehouse)
        .await
        .expect("Failed to acquire a connection");

    //* When
    let copied = stores
        .store
        .copy_from_raw(
            &mut conn,
            "SELECT id, title FROM raw_courses",
            "courses",
            &["id", "title"],
        )
        .await
        .expect("Failed to copy");

    //* Then
    assert_eq!(copied, 500);
    let rows = stores
        .rows(
            Database::Warehouse,
            "SELECT count(*) AS n, max(title) AS last FROM courses",
        )
        .await;
    assert_eq!(rows, vec![json!({"n": 500, "last": "course 99"})]);
}

#[tokio::test]
async fn statements_past_the_timeout_fail_with_timeout() {
    let stores = TempStores::with_timeout(Some(Duration::from_millis(200))).await;

    let result = stores
        .store
        .execute(Database::Raw, "SELECT pg_sleep(5)")
        .await;

    assert!(matches!(
        result,
        Err(StoreError::Timeout {
            db: Database::Raw,
            ..
        })
    ));
}

#[tokio::test]
async fn cancelled_token_stops_new_and_in_flight_calls() {
    //* Given
    let stores = TempStores::with_timeout(None).await;
    let store = stores.store.clone();
    let token = store.cancellation_token().clone();

    //* When
    let in_flight = tokio::spawn({
        let store = store.clone();
        async move { store.execute(Database::Warehouse, "SELECT pg_sleep(5)").await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    token.cancel();
    let in_flight = in_flight.await.expect("task panicked");
    let after = store.tables(Database::Raw).await;

    //* Then
    assert!(matches!(in_flight, Err(StoreError::Cancelled { .. })));
    assert!(matches!(after, Err(StoreError::Cancelled { .. })));
}
