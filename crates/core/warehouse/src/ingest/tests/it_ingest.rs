//! Raw ingestion tests

use pretty_assertions::assert_eq;
use serde_json::json;

use crate::{
    cache::SchemaCache,
    ingest::{IngestError, IngestOptions, Row, TypeMismatch, create_table, insert},
    store::Database,
    test_utils::TempStores,
};

fn rows(values: serde_json::Value) -> Vec<Row> {
    serde_json::from_value(values).expect("Failed to build rows")
}

const INFER: IngestOptions = IngestOptions {
    infer_types: true,
    drop_table_if_exists: false,
};

#[tokio::test]
async fn create_table_infers_types_and_inserts_rows() {
    //* Given
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();
    let data = rows(json!([
        {"id": 1, "title": "Algebra", "active": true, "credits": 3.5},
        {"id": 2, "title": "Biology", "active": "false", "credits": null},
    ]));

    //* When
    let inserted = create_table(&stores.store, &mut cache, INFER, "raw_courses", &data, Some("id"))
        .await
        .expect("Failed to create table");

    //* Then
    assert_eq!(inserted, 2);
    let columns = stores
        .store
        .columns(Database::Raw, "raw_courses")
        .await
        .expect("Failed to describe columns");
    let described: Vec<(&str, &str, bool)> = columns
        .iter()
        .map(|column| {
            (
                column.name.as_str(),
                column.data_type.as_str(),
                column.is_primary_key,
            )
        })
        .collect();
    assert_eq!(
        described,
        [
            ("active", "boolean", false),
            ("credits", "double precision", false),
            ("id", "double precision", true),
            ("title", "text", false),
        ]
    );
    let stored = stores
        .rows(
            Database::Raw,
            "SELECT active, credits, title FROM raw_courses ORDER BY id",
        )
        .await;
    assert_eq!(
        stored,
        vec![
            json!({"active": true, "credits": 3.5, "title": "Algebra"}),
            json!({"active": false, "credits": null, "title": "Biology"}),
        ]
    );
}

#[tokio::test]
async fn without_inference_every_column_is_text() {
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();
    let data = rows(json!([{"code": 7, "flag": true}]));

    create_table(
        &stores.store,
        &mut cache,
        IngestOptions::default(),
        "raw_flags",
        &data,
        None,
    )
    .await
    .expect("Failed to create table");

    let stored = stores
        .rows(Database::Raw, "SELECT code, flag FROM raw_flags")
        .await;
    assert_eq!(stored, vec![json!({"code": "7", "flag": "true"})]);
}

#[tokio::test]
async fn existing_table_is_an_error_unless_recreation_is_enabled() {
    //* Given
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();
    let first = rows(json!([{"title": "old"}]));
    let second = rows(json!([{"title": "new"}, {"title": "newer"}]));
    create_table(&stores.store, &mut cache, INFER, "raw_notes", &first, None)
        .await
        .expect("Failed to create table");

    //* When
    let rejected = create_table(&stores.store, &mut cache, INFER, "raw_notes", &second, None).await;
    let recreated = create_table(
        &stores.store,
        &mut cache,
        IngestOptions {
            drop_table_if_exists: true,
            ..INFER
        },
        "raw_notes",
        &second,
        None,
    )
    .await;

    //* Then
    let source = match rejected {
        Err(IngestError::Store { source, .. }) => source,
        other => panic!("expected a store error, got {other:?}"),
    };
    assert_eq!(source.code().as_deref(), Some("42P07"));
    assert_eq!(recreated.expect("Failed to recreate table"), 2);
    let stored = stores
        .rows(Database::Raw, "SELECT count(*) AS n FROM raw_notes")
        .await;
    assert_eq!(stored, vec![json!({"n": 2})]);
}

#[tokio::test]
async fn insert_appends_matching_rows() {
    //* Given
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();
    create_table(
        &stores.store,
        &mut cache,
        INFER,
        "raw_scores",
        &rows(json!([{"student": "ada", "score": 9.5}])),
        None,
    )
    .await
    .expect("Failed to create table");

    //* When
    let inserted = insert(
        &stores.store,
        &mut cache,
        INFER,
        "raw_scores",
        &rows(json!([{"student": "alan", "score": 8}, {"student": "grace", "score": null}])),
    )
    .await
    .expect("Failed to insert rows");

    //* Then
    assert_eq!(inserted, 2);
    let stored = stores
        .rows(
            Database::Raw,
            "SELECT student, score FROM raw_scores ORDER BY student",
        )
        .await;
    assert_eq!(
        stored,
        vec![
            json!({"student": "ada", "score": 9.5}),
            json!({"student": "alan", "score": 8}),
            json!({"student": "grace", "score": null}),
        ]
    );
}

#[tokio::test]
async fn insert_into_unknown_table_fails() {
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();

    let result = insert(
        &stores.store,
        &mut cache,
        INFER,
        "raw_missing",
        &rows(json!([{"title": "x"}])),
    )
    .await;

    assert!(matches!(
        result,
        Err(IngestError::TableNotFound { ref table_name }) if table_name == "raw_missing"
    ));
}

#[tokio::test]
async fn insert_reports_every_structural_difference() {
    //* Given
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();
    create_table(
        &stores.store,
        &mut cache,
        INFER,
        "raw_scores",
        &rows(json!([{"student": "ada", "score": 9.5, "term": "fall"}])),
        None,
    )
    .await
    .expect("Failed to create table");

    //* When
    let result = insert(
        &stores.store,
        &mut cache,
        INFER,
        "raw_scores",
        &rows(json!([{"student": "alan", "score": "high", "room": "B2"}])),
    )
    .await;

    //* Then
    let (missing_columns, extra_columns, type_mismatches) = match result {
        Err(IngestError::SchemaInconsistency {
            missing_columns,
            extra_columns,
            type_mismatches,
            ..
        }) => (missing_columns, extra_columns, type_mismatches),
        other => panic!("expected a schema inconsistency, got {other:?}"),
    };
    assert_eq!(missing_columns, ["term"]);
    assert_eq!(extra_columns, ["room"]);
    assert_eq!(
        type_mismatches,
        [TypeMismatch {
            column: "score".into(),
            expected: "double precision".into(),
            found: "text".into(),
        }]
    );
}

#[tokio::test]
async fn insert_follows_columns_added_after_an_earlier_insert() {
    //* Given
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();
    create_table(
        &stores.store,
        &mut cache,
        INFER,
        "raw_rooms",
        &rows(json!([{"code": "A1"}])),
        None,
    )
    .await
    .expect("Failed to create table");
    insert(&stores.store, &mut cache, INFER, "raw_rooms", &rows(json!([{"code": "A2"}])))
        .await
        .expect("Failed to insert first batch");
    stores
        .store
        .execute(Database::Raw, "ALTER TABLE raw_rooms ADD COLUMN building TEXT")
        .await
        .expect("Failed to alter table");

    //* When
    let inserted = insert(
        &stores.store,
        &mut cache,
        INFER,
        "raw_rooms",
        &rows(json!([{"code": "B1", "building": "north"}])),
    )
    .await;

    //* Then
    assert_eq!(inserted.expect("Failed to insert after ALTER"), 1);
    let rooms = stores
        .store
        .query(
            Database::Raw,
            "SELECT code, building FROM raw_rooms ORDER BY code",
        )
        .await
        .expect("Failed to query rooms");
    assert_eq!(
        rooms,
        vec![
            json!({"code": "A1", "building": null}),
            json!({"code": "A2", "building": null}),
            json!({"code": "B1", "building": "north"}),
        ]
    );
}

#[tokio::test]
async fn rows_with_different_keys_are_rejected() {
    let stores = TempStores::new().await;
    let mut cache = SchemaCache::new();

    let result = create_table(
        &stores.store,
        &mut cache,
        INFER,
        "raw_mixed",
        &rows(json!([{"a": 1}, {"b": 2}])),
        None,
    )
    .await;

    assert!(matches!(
        result,
        Err(IngestError::InconsistentRows { row: 1, .. })
    ));
    assert!(
        !stores
            .store
            .table_exists(Database::Raw, "raw_mixed")
            .await
            .expect("Failed to check table")
    );
}
