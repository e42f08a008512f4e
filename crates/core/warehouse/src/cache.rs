//! Pipeline-scoped schema cache.

use std::collections::{BTreeMap, BTreeSet};

use crate::store::{ColumnInfo, Database};

/// Protected columns of core tables, plus the column schemas read during a run.
///
/// Protected sets only ever grow: a column, once protected, stays protected for the lifetime
/// of the cache. Schemas are a plain memo and are invalidated whenever DDL touches a table.
#[derive(Debug, Default, Clone)]
pub struct SchemaCache {
    protected: BTreeMap<String, BTreeSet<String>>,
    schemas: BTreeMap<(Database, String), Vec<ColumnInfo>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add columns to the protected set of `table`.
    pub fn protect(&mut self, table: &str, columns: impl IntoIterator<Item = impl Into<String>>) {
        self.protected
            .entry(table.to_string())
            .or_default()
            .extend(columns.into_iter().map(Into::into));
    }

    /// Protected columns of `table`; empty for tables that are not core tables.
    pub fn protected_columns(&self, table: &str) -> BTreeSet<String> {
        self.protected.get(table).cloned().unwrap_or_default()
    }

    pub fn schema(&self, db: Database, table: &str) -> Option<&[ColumnInfo]> {
        self.schemas
            .get(&(db, table.to_string()))
            .map(Vec::as_slice)
    }

    pub fn store_schema(&mut self, db: Database, table: &str, columns: Vec<ColumnInfo>) {
        self.schemas.insert((db, table.to_string()), columns);
    }

    pub fn invalidate(&mut self, db: Database, table: &str) {
        self.schemas.remove(&(db, table.to_string()));
    }

    /// Forget every memoized schema of `db`, for statements whose DDL targets are unknown.
    pub fn invalidate_database(&mut self, db: Database) {
        self.schemas.retain(|(schema_db, _), _| *schema_db != db);
    }
}
