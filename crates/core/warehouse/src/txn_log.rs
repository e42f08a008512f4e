//! Append-only transaction logs of per-field edits.
//!
//! A log records edits against warehouse tables without touching the tables themselves. The
//! overlay views built by [`crate::overlay`] read it back. Depending on the configured
//! strategy there is one shared log for the whole warehouse, or one `<table>_<name>` log per
//! promoted table.

use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use config::TransactionStrategy;
use sqlx::{Executor, Postgres};
use staging::sql::{ValidateIdentifierError, ident, validate_identifier};

use crate::store::{Database, Store, StoreError};

/// Prefix of overlay view names.
pub const OVERLAY_VIEW_PREFIX: &str = "view_";

/// Name of the overlay view published for `table`.
pub fn overlay_view_name(table: &str) -> String {
    format!("{OVERLAY_VIEW_PREFIX}{table}")
}

/// Maps warehouse tables to the log that records their edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    pub strategy: TransactionStrategy,
    /// Shared log name, or the suffix of per-table log names
    pub base_name: String,
}

impl LogLayout {
    pub fn new(strategy: TransactionStrategy, base_name: impl Into<String>) -> Self {
        Self {
            strategy,
            base_name: base_name.into(),
        }
    }

    /// Log table holding the edits of `table`.
    pub fn log_table_for(&self, table: &str) -> String {
        match self.strategy {
            TransactionStrategy::SingleTable => self.base_name.clone(),
            TransactionStrategy::PerTable => format!("{table}_{}", self.base_name),
        }
    }
}

/// Kind of edit recorded by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log action '{0}', expected insert, update or delete")]
pub struct InvalidAction(pub String);

impl FromStr for Action {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Action::Insert),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            _ => Err(InvalidAction(s.to_string())),
        }
    }
}

/// An edit to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    /// Primary key value of the edited row
    pub target_id: i32,
    /// Edited column; deletes may leave it unset
    pub target_column: Option<String>,
    pub new_value: Option<String>,
    pub action: Action,
    /// Defaults to the database clock
    pub created_at: Option<NaiveDateTime>,
}

impl NewLogEntry {
    pub fn update(target_id: i32, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            target_id,
            target_column: Some(column.into()),
            new_value: Some(value.into()),
            action: Action::Update,
            created_at: None,
        }
    }

    pub fn delete(target_id: i32) -> Self {
        Self {
            target_id,
            target_column: None,
            new_value: None,
            action: Action::Delete,
            created_at: None,
        }
    }

    pub fn at(mut self, created_at: NaiveDateTime) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Errors that can occur when recording an edit.
#[derive(Debug, thiserror::Error)]
pub enum AppendLogEntryError {
    #[error("warehouse table '{table_name}' does not exist")]
    UnknownTable { table_name: String },

    #[error("table '{table_name}' has no column '{column}'")]
    UnknownColumn { table_name: String, column: String },

    /// Inserts and updates must name the edited column
    #[error("'{action}' entries for table '{table_name}' must name a target column")]
    MissingColumn { table_name: String, action: Action },

    #[error("invalid log table name '{name}'")]
    InvalidLogName {
        name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    #[error("failed to record an edit of table '{table_name}'")]
    Store {
        table_name: String,
        #[source]
        source: StoreError,
    },
}

/// DDL of a log table. Creating an existing log is a no-op.
pub fn create_log_table_sql(name: &str) -> String {
    indoc::formatdoc! {r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                target_table VARCHAR(50),
                target_column VARCHAR(50),
                target_id INTEGER,
                new_value VARCHAR(255),
                action VARCHAR(10),
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )"#,
        ident(name)
    }
}

/// Create the log table `name` in the warehouse unless it exists.
///
/// Returns whether the table was created.
pub async fn ensure_log_table(store: &Store, name: &str) -> Result<bool, StoreError> {
    if store.table_exists(Database::Warehouse, name).await? {
        return Ok(false);
    }
    store
        .execute(Database::Warehouse, &create_log_table_sql(name))
        .await?;
    tracing::info!(log_table = %name, "transaction_log_created");
    Ok(true)
}

/// Insert one entry into `log_table` and return its id.
pub async fn insert_entry<'c, E>(
    exe: E,
    log_table: &str,
    target_table: &str,
    entry: &NewLogEntry,
) -> Result<i32, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::formatdoc! {r#"
            INSERT INTO {} (target_table, target_column, target_id, new_value, action, created_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, LOCALTIMESTAMP))
            RETURNING id
        "#,
        ident(log_table)
    };
    sqlx::query_scalar(&query)
        .bind(target_table)
        .bind(entry.target_column.as_deref())
        .bind(entry.target_id)
        .bind(entry.new_value.as_deref())
        .bind(entry.action.as_str())
        .bind(entry.created_at)
        .fetch_one(exe)
        .await
}

/// Validate a log table name derived from a table name.
pub(crate) fn validate_log_name(name: &str) -> Result<(), AppendLogEntryError> {
    validate_identifier(name).map_err(|err| AppendLogEntryError::InvalidLogName {
        name: name.to_string(),
        source: err,
    })
}
