//! Ephemeral raw and warehouse databases for tests.

use std::time::Duration;

use config::DatabaseConfig;
use pgtemp::PgTempDB;
use tokio_util::sync::CancellationToken;

use crate::store::{Database, DbConnPool, Store};

/// Pool settings for a throwaway server.
pub fn pool_config(db: &PgTempDB) -> DatabaseConfig {
    DatabaseConfig {
        pool_size: 4,
        ..DatabaseConfig::new(db.connection_uri())
    }
}

/// A [`Store`] over two throwaway PostgreSQL servers.
///
/// The servers are shut down when the value is dropped.
pub struct TempStores {
    pub store: Store,
    _raw_db: PgTempDB,
    _warehouse_db: PgTempDB,
}

impl TempStores {
    pub async fn new() -> Self {
        Self::with_timeout(Some(Duration::from_secs(30))).await
    }

    pub async fn with_timeout(statement_timeout: Option<Duration>) -> Self {
        let raw_db = PgTempDB::new();
        let warehouse_db = PgTempDB::new();

        let raw = DbConnPool::connect(Database::Raw, &pool_config(&raw_db))
            .await
            .expect("Failed to connect to raw db");
        let warehouse = DbConnPool::connect(Database::Warehouse, &pool_config(&warehouse_db))
            .await
            .expect("Failed to connect to warehouse db");

        Self {
            store: Store::from_pools(raw, warehouse, statement_timeout, CancellationToken::new()),
            _raw_db: raw_db,
            _warehouse_db: warehouse_db,
        }
    }

    /// Run setup statements.
    pub async fn exec(&self, db: Database, statements: &str) {
        self.store
            .execute(db, statements)
            .await
            .expect("Failed to run setup statements");
    }

    /// Fetch `SELECT` results as JSON objects.
    pub async fn rows(&self, db: Database, statement: &str) -> Vec<serde_json::Value> {
        self.store
            .query(db, statement)
            .await
            .expect("Failed to query")
    }
}
