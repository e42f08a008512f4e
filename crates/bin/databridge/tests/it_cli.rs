//! Tests driving the `databridge` binary

use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

use fs_err as fs;
use pgtemp::PgTempDB;
use tempfile::TempDir;

fn databridge(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_databridge"))
        .args(args)
        .env_remove("DATABRIDGE_CONFIG")
        .env("DATABRIDGE_LOG", "error")
        .output()
        .expect("Failed to run databridge")
}

fn write_file(dir: &Path, relative_path: &str, content: &str) {
    let path = dir.join(relative_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dirs");
    }
    fs::write(&path, content).expect("Failed to write file");
}

/// A project directory with a config file and two stages, `titles` declared before the
/// `courses` stage it depends on.
fn project(raw_url: &str, warehouse_url: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create project dir");
    write_file(
        dir.path(),
        "databridge.toml",
        &format!(
            r#"
            [raw]
            url = "{raw_url}"
            pool_size = 2

            [warehouse]
            url = "{warehouse_url}"
            pool_size = 2

            [pipeline]
            staging_dir = "staging"
            core_dir = "core"
            statement_timeout_secs = 30
            "#
        ),
    );
    write_file(
        dir.path(),
        "staging/a_titles.toml",
        r#"
        [MAIN]
        name = "titles"

        [IO]
        datasources = ["courses_view"]
        datamarts = ["course_titles"]

        [STAGING]
        files = ["titles.sql"]
        "#,
    );
    write_file(
        dir.path(),
        "staging/titles.sql",
        "CREATE OR REPLACE VIEW course_titles AS SELECT code, title FROM courses_view",
    );
    write_file(
        dir.path(),
        "staging/z_courses.toml",
        r#"
        [MAIN]
        name = "courses"

        [IO]
        datasources = ["raw_courses"]
        datamarts = ["courses_view AS courses"]

        [STAGING]
        files = ["courses.sql"]
        "#,
    );
    write_file(
        dir.path(),
        "staging/courses.sql",
        "CREATE OR REPLACE VIEW courses_view AS SELECT code, title FROM raw_courses",
    );
    let config = dir.path().join("databridge.toml");
    (dir, config)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn new_stage_writes_the_template() {
    //* Given
    let dir = TempDir::new().expect("Failed to create temp dir");
    let target = dir.path().join("stages/new");

    //* When
    let output = databridge(&["new-stage", target.to_str().expect("utf-8 path")]);

    //* Then
    assert!(output.status.success(), "{output:?}");
    let template = fs::read_to_string(target.join("empty_configuration.toml"))
        .expect("Failed to read template");
    assert!(template.contains("[MAIN]"));
    assert!(template.contains("[IO]"));
    assert!(template.contains("[STAGING]"));
}

#[test]
fn order_prints_stages_in_dependency_order_offline() {
    //* Given
    let (_dir, config) = project(
        "postgres://nobody@localhost:1/raw",
        "postgres://nobody@localhost:1/warehouse",
    );

    //* When
    let output = databridge(&["--config", config.to_str().expect("utf-8 path"), "order"]);

    //* Then
    assert!(output.status.success(), "{output:?}");
    let printed = stdout(&output);
    assert!(printed.contains("  1. courses"), "{printed}");
    assert!(printed.contains("  2. titles"), "{printed}");
    assert!(printed.contains("(No core tables configured)"), "{printed}");
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = dir.path().join("absent.toml");

    let output = databridge(&["--config", config.to_str().expect("utf-8 path"), "order"]);

    assert!(!output.status.success());
}

#[tokio::test]
async fn run_promotes_stages_and_verify_reflects_it() {
    //* Given
    let raw_db = PgTempDB::new();
    let warehouse_db = PgTempDB::new();
    let (_dir, config) = project(&raw_db.connection_uri(), &warehouse_db.connection_uri());
    let config = config.to_str().expect("utf-8 path").to_string();

    let pool = sqlx::PgPool::connect(&raw_db.connection_uri())
        .await
        .expect("Failed to connect to raw db");
    sqlx::raw_sql(
        "CREATE TABLE raw_courses (code TEXT PRIMARY KEY, title TEXT); INSERT INTO raw_courses VALUES ('ALG', 'Algebra')",
    )
    .execute(&pool)
    .await
    .expect("Failed to seed raw db");

    //* When
    let before = databridge(&["--config", &config, "verify"]);
    let run = databridge(&["--config", &config, "run"]);
    let after = databridge(&["--config", &config, "verify"]);

    //* Then
    assert!(!before.status.success(), "{before:?}");
    assert!(stdout(&before).contains("course_titles"));
    assert!(run.status.success(), "{run:?}");
    assert!(stdout(&run).contains("courses_view -> courses"), "{}", stdout(&run));
    assert!(after.status.success(), "{after:?}");
}
