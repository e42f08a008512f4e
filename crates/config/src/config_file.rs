//! TOML configuration file loading with environment variable overrides.
//!
//! Deserializes a [`ConfigFile`] from a TOML file using [Figment], merging
//! `DATABRIDGE_CONFIG_*` environment variables on top. The raw [`ConfigFile`]
//! is later resolved into a [`Config`](crate::Config) by [`crate::Config::load`].
//!
//! ## Priority chain
//!
//! | Priority | Source | Mechanism |
//! |----------|--------|-----------|
//! | 1 (highest) | `DATABRIDGE_CONFIG_*` env vars | `merge`, always wins |
//! | 2 | TOML file values | `merge`, base configuration |
//! | 3 (lowest) | serde defaults | applied on extraction |
//!
//! ## Environment variables
//!
//! All env vars are prefixed with `DATABRIDGE_CONFIG_` and use double underscores to
//! separate nested keys. For example, `DATABRIDGE_CONFIG_WAREHOUSE__URL` maps to
//! `warehouse.url` and `DATABRIDGE_CONFIG_PIPELINE__TRANSACTION_STRATEGY` maps to
//! `pipeline.transaction_strategy`.

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};

use crate::{DatabaseUrl, TransactionStrategy, TypeDriftPolicy};

/// Prefix of the environment variables overriding config file values.
pub const ENV_PREFIX: &str = "DATABRIDGE_CONFIG_";

/// Default directory holding the stage descriptors.
pub const DEFAULT_STAGING_DIR: &str = "./databridging/staging";

/// Default directory holding `core_tables.toml` and its `sql/` folder.
pub const DEFAULT_CORE_DIR: &str = "./databridging/core";

/// Default name of the shared transaction log table.
pub const DEFAULT_TRANSACTION_TABLE_NAME: &str = "transactions";

/// Default per-statement deadline, in seconds.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 300;

/// Default connection pool size for each store.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Default number of retries while a store is not reachable yet.
pub const DEFAULT_CONNECT_RETRIES: usize = 10;

/// Default wait for a free pooled connection, in seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Error returned when the config file or env overrides cannot be extracted.
#[derive(Debug, thiserror::Error)]
#[error("failed to extract configuration")]
pub struct LoadConfigFileError(#[source] pub Box<figment::Error>);

/// Load a [`ConfigFile`] from a TOML file with env-var overrides.
///
/// See the [module-level docs](self) for the priority chain.
pub fn load(config_path: &Path) -> Result<ConfigFile, LoadConfigFileError> {
    Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|err| LoadConfigFileError(Box::new(err)))
}

/// Raw configuration as deserialized from the TOML config file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConfigFile {
    /// Connection settings of the raw store
    pub raw: DatabaseSection,
    /// Connection settings of the warehouse store
    pub warehouse: DatabaseSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DatabaseSection {
    /// Database connection URL (required)
    pub url: DatabaseUrl,
    /// Size of the connection pool (default: 10)
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Connection attempts retried before giving up, 0 fails on the first error (default: 10)
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
    /// Wait for a free pooled connection (default: 5)
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PipelineSection {
    /// Directory scanned recursively for stage descriptors (default: `./databridging/staging`)
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// Directory holding the core table descriptors (default: `./databridging/core`)
    #[serde(default = "default_core_dir")]
    pub core_dir: String,
    #[serde(default)]
    pub transaction_strategy: TransactionStrategy,
    /// Name of the shared log, or suffix of the per-table logs (default: `transactions`)
    #[serde(default = "default_transaction_table_name")]
    pub transaction_table_name: String,
    /// Drop and recreate raw tables that already exist on creation (default: false)
    #[serde(default)]
    pub drop_table_if_exists: bool,
    #[serde(default)]
    pub type_drift: TypeDriftPolicy,
    /// Deadline applied to every store call, 0 disables it (default: 300)
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    /// Infer BOOLEAN and DOUBLE PRECISION columns on ingestion instead of TEXT (default: false)
    #[serde(default)]
    pub infer_types: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            core_dir: default_core_dir(),
            transaction_strategy: TransactionStrategy::default(),
            transaction_table_name: default_transaction_table_name(),
            drop_table_if_exists: false,
            type_drift: TypeDriftPolicy::default(),
            statement_timeout_secs: default_statement_timeout_secs(),
            infer_types: false,
        }
    }
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_connect_retries() -> usize {
    DEFAULT_CONNECT_RETRIES
}

fn default_acquire_timeout_secs() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_SECS
}

fn default_staging_dir() -> String {
    DEFAULT_STAGING_DIR.into()
}

fn default_core_dir() -> String {
    DEFAULT_CORE_DIR.into()
}

fn default_transaction_table_name() -> String {
    DEFAULT_TRANSACTION_TABLE_NAME.into()
}

fn default_statement_timeout_secs() -> u64 {
    DEFAULT_STATEMENT_TIMEOUT_SECS
}
