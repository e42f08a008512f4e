//! Access to the raw and warehouse PostgreSQL databases.
//!
//! Both databases are reached through a [`Store`]. Every statement it issues is bounded by the
//! configured statement timeout and aborted as soon as the shared cancellation token fires:
//!
//! ```text
//! call ──► cancelled? ──► timeout(limit, statement) ──► select!(cancel, statement)
//!              │                     │                          │
//!              ▼                     ▼                          ▼
//!      StoreError::Cancelled  StoreError::Timeout      StoreError::Query / Ok
//! ```
//!
//! Statement failures are never retried. Only pool establishment retries, with exponential
//! backoff, on errors that look like a database that is not reachable yet.

use std::{fmt, future::Future, str::FromStr, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use config::DatabaseConfig;
use futures::StreamExt as _;
use sqlparser::{ast::Statement, dialect::PostgreSqlDialect, parser::Parser};
use sqlx::{
    PgConnection, Pool, Postgres,
    pool::PoolConnection,
    postgres::{PgPoolCopyExt as _, PgPoolOptions},
};
use tokio_util::sync::CancellationToken;

pub mod sql;

/// One of the two logical databases the pipeline works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Database {
    /// Ingested sources and staging views
    Raw,
    /// Promoted tables, transaction logs and overlay views
    Warehouse,
}

impl Database {
    pub fn as_str(&self) -> &'static str {
        match self {
            Database::Raw => "raw",
            Database::Warehouse => "warehouse",
        }
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Database {
    type Err = InvalidDatabaseName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("raw") {
            Ok(Database::Raw)
        } else if s.eq_ignore_ascii_case("warehouse") {
            Ok(Database::Warehouse)
        } else {
            Err(InvalidDatabaseName(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid database name '{0}', expected 'raw' or 'warehouse'")]
pub struct InvalidDatabaseName(pub String);

/// Errors that can occur when establishing a connection pool.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Error connecting to the DB.
    #[error("Error connecting to db: {0}")]
    ConnectionError(#[source] sqlx::Error),
}

/// A connection pool to one of the pipeline databases.
#[derive(Debug, Clone)]
pub struct DbConnPool(Pool<Postgres>);

impl DbConnPool {
    /// Open the pool of `db`, retrying with exponential backoff while the server is unreachable.
    ///
    /// `config.connect_retries` bounds the retries. Any other error fails at once.
    #[tracing::instrument(skip_all, fields(db = %db), err)]
    pub async fn connect(db: Database, config: &DatabaseConfig) -> Result<Self, ConnError> {
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_max_times(config.connect_retries);
        let pool_options = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout);
        let url = config.url.as_str();

        (|| pool_options.clone().connect(url))
            .retry(retry_policy)
            .when(is_unreachable)
            .notify(|err: &sqlx::Error, delay: Duration| {
                tracing::warn!(
                    db = %db,
                    error = %err,
                    retry_delay_secs = delay.as_secs_f32(),
                    "db_connection_retry"
                );
            })
            .await
            .map(Self)
            .map_err(ConnError::ConnectionError)
    }
}

/// Whether `err` means the server cannot be reached yet, as opposed to a rejected login or a
/// malformed URL.
fn is_unreachable(err: &sqlx::Error) -> bool {
    match err {
        // Class 08 is connection_exception.
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code.starts_with("08") || code == "57P03" || code == "53300"
        }),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

impl From<Pool<Postgres>> for DbConnPool {
    fn from(pool: Pool<Postgres>) -> Self {
        Self(pool)
    }
}

impl std::ops::Deref for DbConnPool {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A column as reported by catalog introspection.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ColumnInfo {
    pub name: String,
    /// Type rendered by `format_type`, e.g. `integer` or `character varying(50)`
    pub data_type: String,
    pub is_primary_key: bool,
    pub references_table: Option<String>,
    pub references_column: Option<String>,
}

impl ColumnInfo {
    /// Referenced `(table, column)` when the column carries a foreign key.
    pub fn foreign_key(&self) -> Option<(&str, &str)> {
        match (&self.references_table, &self.references_column) {
            (Some(table), Some(column)) => Some((table, column)),
            _ => None,
        }
    }
}

/// Errors returned by [`Store`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to the {db} database")]
    Connect {
        db: Database,
        #[source]
        source: ConnError,
    },

    /// The statement failed; the server error is preserved unchanged
    #[error("{operation} on the {db} database failed")]
    Query {
        db: Database,
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{operation} on the {db} database exceeded the statement timeout of {limit:?}")]
    Timeout {
        db: Database,
        operation: &'static str,
        limit: Duration,
    },

    #[error("{operation} on the {db} database was cancelled")]
    Cancelled {
        db: Database,
        operation: &'static str,
    },

    /// `query` only accepts a single read statement
    #[error("expected a single read query: {reason}")]
    WrongQueryType { reason: String },
}

impl StoreError {
    /// SQLSTATE of the underlying server error, if any.
    pub fn code(&self) -> Option<String> {
        match self {
            StoreError::Query {
                source: sqlx::Error::Database(db_err),
                ..
            } => db_err.code().map(|code| code.into_owned()),
            _ => None,
        }
    }
}

/// The raw and warehouse connection pools plus the limits applied to every call.
#[derive(Debug, Clone)]
pub struct Store {
    raw: DbConnPool,
    warehouse: DbConnPool,
    statement_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Store {
    /// Connect both pools.
    #[tracing::instrument(skip_all, err)]
    pub async fn connect(
        raw: &DatabaseConfig,
        warehouse: &DatabaseConfig,
        statement_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        let raw_pool = DbConnPool::connect(Database::Raw, raw)
            .await
            .map_err(|err| StoreError::Connect {
                db: Database::Raw,
                source: err,
            })?;
        let warehouse_pool = DbConnPool::connect(Database::Warehouse, warehouse)
            .await
            .map_err(|err| StoreError::Connect {
                db: Database::Warehouse,
                source: err,
            })?;

        tracing::info!(
            raw = ?raw.url,
            warehouse = ?warehouse.url,
            "store_connected"
        );

        Ok(Self::from_pools(
            raw_pool,
            warehouse_pool,
            statement_timeout,
            cancel,
        ))
    }

    /// Build a store over already established pools.
    pub fn from_pools(
        raw: impl Into<DbConnPool>,
        warehouse: impl Into<DbConnPool>,
        statement_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            raw: raw.into(),
            warehouse: warehouse.into(),
            statement_timeout,
            cancel,
        }
    }

    pub fn pool(&self, db: Database) -> &Pool<Postgres> {
        match db {
            Database::Raw => &self.raw,
            Database::Warehouse => &self.warehouse,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `fut` under the statement timeout and the cancellation token.
    pub(crate) async fn guard<T, F>(
        &self,
        db: Database,
        operation: &'static str,
        fut: F,
    ) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled { db, operation });
        }

        let bounded = async {
            let result = match self.statement_timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| StoreError::Timeout {
                        db,
                        operation,
                        limit,
                    })?,
                None => fut.await,
            };
            result.map_err(|source| StoreError::Query {
                db,
                operation,
                source,
            })
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled { db, operation }),
            result = bounded => result,
        }
    }

    /// Check out a dedicated connection, for work that relies on session state.
    pub(crate) async fn acquire(
        &self,
        db: Database,
    ) -> Result<PoolConnection<Postgres>, StoreError> {
        self.guard(db, "acquire", self.pool(db).acquire()).await
    }

    /// Run one or more statements without a result.
    pub async fn execute(&self, db: Database, statements: &str) -> Result<(), StoreError> {
        self.guard(db, "execute", sqlx::raw_sql(statements).execute(self.pool(db)))
            .await
            .map(|_| ())
    }

    /// Run one or more statements on a dedicated connection.
    pub(crate) async fn execute_on(
        &self,
        conn: &mut PgConnection,
        db: Database,
        statements: &str,
    ) -> Result<(), StoreError> {
        self.guard(db, "execute", sqlx::raw_sql(statements).execute(conn))
            .await
            .map(|_| ())
    }

    pub async fn tables(&self, db: Database) -> Result<Vec<String>, StoreError> {
        self.guard(db, "list tables", sql::list_tables(self.pool(db)))
            .await
    }

    pub async fn views(&self, db: Database) -> Result<Vec<String>, StoreError> {
        self.guard(db, "list views", sql::list_views(self.pool(db)))
            .await
    }

    /// Check whether a table or view exists.
    pub async fn relation_exists(&self, db: Database, name: &str) -> Result<bool, StoreError> {
        self.guard(db, "check relation", sql::relation_exists(self.pool(db), name))
            .await
    }

    /// Check whether a base table exists.
    pub async fn table_exists(&self, db: Database, name: &str) -> Result<bool, StoreError> {
        self.guard(db, "check table", sql::table_exists(self.pool(db), name))
            .await
    }

    pub async fn has_rows(&self, db: Database, name: &str) -> Result<bool, StoreError> {
        self.guard(db, "count rows", sql::has_rows(self.pool(db), name))
            .await
    }

    /// Describe the columns of a table or view. Unknown relations yield no columns.
    pub async fn columns(&self, db: Database, name: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        self.guard(db, "describe columns", sql::columns(self.pool(db), name))
            .await
    }

    /// Run exactly one read query and return its rows as JSON objects.
    #[tracing::instrument(skip_all, fields(%db), err)]
    pub async fn query(
        &self,
        db: Database,
        statement: &str,
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        let statement = single_read_query(statement)?;
        self.guard(db, "query", sql::query_json(self.pool(db), &statement))
            .await
    }

    /// Stream the result of `select` on the raw database into `target (columns)` over `conn`,
    /// using the COPY protocol on both sides. Returns the number of rows written.
    pub(crate) async fn copy_from_raw(
        &self,
        conn: &mut PgConnection,
        select: &str,
        target: &str,
        columns: &[&str],
    ) -> Result<u64, StoreError> {
        let copy_out = format!("COPY ({select}) TO STDOUT");
        let copy_in = format!(
            "COPY {} ({}) FROM STDIN",
            staging::sql::ident(target),
            staging::sql::ident_list(columns.iter().copied())
        );

        let raw = &self.raw;
        let mut source = self
            .guard(Database::Raw, "copy out", raw.copy_out_raw(&copy_out))
            .await?;

        self.guard(Database::Warehouse, "copy in", async move {
            let mut sink = conn.copy_in_raw(&copy_in).await?;
            while let Some(chunk) = source.next().await {
                let sent = match chunk {
                    Ok(bytes) => sink.send(bytes).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    if let Err(abort_err) = sink.abort(err.to_string()).await {
                        tracing::debug!(error = %abort_err, "copy_abort_acknowledged");
                    }
                    return Err(err);
                }
            }
            sink.finish().await
        })
        .await
    }
}

/// Accept one query statement and render it back without a trailing semicolon.
fn single_read_query(statement: &str) -> Result<String, StoreError> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, statement).map_err(|err| {
        StoreError::WrongQueryType {
            reason: err.to_string(),
        }
    })?;
    if statements.len() != 1 {
        return Err(StoreError::WrongQueryType {
            reason: format!("got {} statements", statements.len()),
        });
    }
    match statements.pop() {
        Some(query @ Statement::Query(_)) => Ok(query.to_string()),
        Some(other) => Err(StoreError::WrongQueryType {
            reason: format!("not a query: {other}"),
        }),
        None => Err(StoreError::WrongQueryType {
            reason: "empty statement".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    mod it_store;

    use super::*;

    #[test]
    fn only_unreachable_servers_are_retried() {
        assert!(is_unreachable(&sqlx::Error::PoolTimedOut));
        assert!(is_unreachable(&sqlx::Error::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused
        ))));
        assert!(!is_unreachable(&sqlx::Error::Configuration("bad url".into())));
        assert!(!is_unreachable(&sqlx::Error::PoolClosed));
    }

    #[tokio::test]
    async fn connect_without_retries_fails_on_the_first_refusal() {
        //* Given
        let config = DatabaseConfig {
            connect_retries: 0,
            acquire_timeout: Duration::from_secs(1),
            ..DatabaseConfig::new("postgres://nobody@127.0.0.1:1/raw")
        };

        //* When
        let result = DbConnPool::connect(Database::Raw, &config).await;

        //* Then
        assert!(matches!(result, Err(ConnError::ConnectionError(_))));
    }

    #[test]
    fn database_parses_case_insensitively() {
        assert_eq!("raw".parse(), Ok(Database::Raw));
        assert_eq!("WareHouse".parse(), Ok(Database::Warehouse));
        assert_eq!(
            "staging".parse::<Database>(),
            Err(InvalidDatabaseName("staging".into()))
        );
    }

    #[test]
    fn single_read_query_accepts_one_select() {
        let statement = single_read_query("SELECT id, name FROM students WHERE id > 1;")
            .expect("should accept a select");
        assert_eq!(statement, "SELECT id, name FROM students WHERE id > 1");
    }

    #[test]
    fn single_read_query_rejects_writes_and_batches() {
        assert!(matches!(
            single_read_query("DELETE FROM students"),
            Err(StoreError::WrongQueryType { .. })
        ));
        assert!(matches!(
            single_read_query("SELECT 1; SELECT 2"),
            Err(StoreError::WrongQueryType { .. })
        ));
        assert!(matches!(
            single_read_query("SELEKT"),
            Err(StoreError::WrongQueryType { .. })
        ));
    }
}
