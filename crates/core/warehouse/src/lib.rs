//! Database side of the pipeline: promotion of raw staging views into warehouse tables,
//! transaction logs with their overlay views, core schema bootstrap and raw ingestion.
//!
//! The entry point is [`Pipeline`]. The lower-level modules are public so that tools can drive
//! single steps against a [`Store`].

pub mod bootstrap;
pub mod cache;
pub mod ingest;
pub mod overlay;
pub mod pipeline;
pub mod promote;
pub mod store;
pub mod txn_log;

#[cfg(test)]
mod test_utils;

pub use self::{
    cache::SchemaCache,
    ingest::{IngestError, Row},
    pipeline::{OpenError, Pipeline, RunError, RunReport, StageError},
    promote::{PromoteError, Promotion},
    store::{ColumnInfo, Database, Store, StoreError},
    txn_log::{Action, AppendLogEntryError, NewLogEntry},
};
