//! The raw → warehouse pipeline.
//!
//! A [`Pipeline`] owns the store, the pipeline configuration and everything that lives for the
//! duration of the process: the schema cache, the overlay view ↔ table association and the list
//! of transaction log tables. Runs are strictly sequential:
//!
//! ```text
//! discover stages ─► order (raw tables + views as base) ─► for each stage:
//!     execute staging files on raw ─► for each datamart:
//!         promote ─► ensure log ─► recreate overlay view ─► register view ↔ table
//! ─► verify every datamart ─► RunReport
//! ```
//!
//! Nothing is rolled back on failure. A run that aborts half way leaves the tables it already
//! promoted in place, and the next verification reports what is missing.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use config::{Config, PipelineConfig, TransactionStrategy};
use fs_err as fs;
use staging::{
    CoreTableConfig, Datamart, LoadStageError, ResolveError, StageConfig, TabularError,
    TabularFormat,
    stage::{discover_stages, order_stages, render_stage_order},
    tabular,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bootstrap::{BootstrapError, bootstrap_core_schema},
    cache::SchemaCache,
    ingest::{self, IngestError, IngestOptions, Row},
    overlay::{OverlayError, overlay_view_sql},
    promote::{PromoteError, Promotion, promote},
    store::{Database, Store, StoreError},
    txn_log::{
        Action, AppendLogEntryError, LogLayout, NewLogEntry, ensure_log_table, insert_entry,
        overlay_view_name, validate_log_name,
    },
};

/// Errors that can occur while opening a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to connect to the stores")]
    Connect(#[source] StoreError),

    #[error("failed to bootstrap the core schema")]
    Bootstrap(#[source] BootstrapError),

    #[error("failed to create transaction log '{log_table}'")]
    TransactionLog {
        log_table: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid transaction log name")]
    InvalidLogName(#[source] AppendLogEntryError),

    #[error("failed to load stage descriptors")]
    LoadStages(#[source] LoadStageError),

    #[error("failed to read the existing warehouse state")]
    Restore(#[source] StoreError),
}

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to load stage descriptors")]
    LoadStages(#[source] LoadStageError),

    #[error("failed to list the raw database relations")]
    ListRawRelations(#[source] StoreError),

    #[error("failed to order stages")]
    Order(#[source] ResolveError),

    #[error("no stage named '{stage}'")]
    UnknownStage { stage: String },

    /// A stage failed; earlier stages of the run stay applied
    #[error("stage '{stage}' failed")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("failed to verify the warehouse")]
    Verify(#[source] StoreError),
}

/// Errors raised while running one stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("staging file {} does not exist", path.display())]
    MissingStagingFile { path: PathBuf },

    #[error("staging file {} has an unsupported extension, expected .sql, .csv or .tsv", path.display())]
    UnsupportedStagingFile { path: PathBuf },

    #[error("failed to read staging file {}", path.display())]
    ReadStagingFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile staging file {}", path.display())]
    Tabular {
        path: PathBuf,
        #[source]
        source: TabularError,
    },

    #[error("failed to read the columns of raw table '{table_name}'")]
    DescribeSource {
        table_name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to execute staging file {}", path.display())]
    ExecuteStagingFile {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("failed to promote datamart '{datamart}'")]
    Promote {
        datamart: String,
        #[source]
        source: PromoteError,
    },

    #[error("invalid transaction log name for '{table_name}'")]
    InvalidLogName {
        table_name: String,
        #[source]
        source: AppendLogEntryError,
    },

    #[error("failed to create transaction log '{log_table}'")]
    TransactionLog {
        log_table: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to build the overlay view of '{table_name}'")]
    Overlay {
        table_name: String,
        #[source]
        source: OverlayError,
    },

    #[error("failed to create the overlay view of '{table_name}'")]
    CreateOverlay {
        table_name: String,
        #[source]
        source: StoreError,
    },
}

/// Outcome of one promoted datamart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatamartReport {
    pub datamart: Datamart,
    pub promotion: Promotion,
    pub overlay_view: String,
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub datamarts: Vec<DatamartReport>,
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Stages in execution order
    pub stages: Vec<StageReport>,
    /// Datamart targets missing or empty in the warehouse after the run
    pub failed_verification: Vec<String>,
}

impl RunReport {
    pub fn is_verified(&self) -> bool {
        self.failed_verification.is_empty()
    }
}

/// The pipeline and its process-lifetime state.
///
/// One value runs at most one transformation at a time. Two processes running against the
/// same warehouse are not coordinated.
#[derive(Debug)]
pub struct Pipeline {
    store: Store,
    config: PipelineConfig,
    layout: LogLayout,
    cache: SchemaCache,
    view_table_association: BTreeMap<String, String>,
    transaction_tables: Vec<String>,
    transformation_occurred: bool,
}

impl Pipeline {
    /// Connect to both databases and open the pipeline on them.
    #[tracing::instrument(skip_all, err)]
    pub async fn open(config: &Config, cancel: CancellationToken) -> Result<Self, OpenError> {
        let store = Store::connect(
            &config.raw,
            &config.warehouse,
            config.pipeline.statement_timeout,
            cancel,
        )
        .await
        .map_err(OpenError::Connect)?;
        Self::with_store(store, config.pipeline.clone()).await
    }

    /// Open the pipeline on an existing store.
    ///
    /// Bootstraps the core schema, creates the shared log when configured, and restores the
    /// overlay association and log list if the existing warehouse verifies.
    pub async fn with_store(store: Store, config: PipelineConfig) -> Result<Self, OpenError> {
        let layout = LogLayout::new(
            config.transaction_strategy,
            config.transaction_table_name.clone(),
        );
        let mut pipeline = Self {
            store,
            config,
            layout,
            cache: SchemaCache::new(),
            view_table_association: BTreeMap::new(),
            transaction_tables: Vec::new(),
            transformation_occurred: false,
        };

        pipeline.bootstrap().await.map_err(OpenError::Bootstrap)?;

        if pipeline.layout.strategy == TransactionStrategy::SingleTable {
            let log_table = pipeline.layout.base_name.clone();
            validate_log_name(&log_table).map_err(OpenError::InvalidLogName)?;
            ensure_log_table(&pipeline.store, &log_table)
                .await
                .map_err(|err| OpenError::TransactionLog {
                    log_table,
                    source: err,
                })?;
        }

        let stages = discover_stages(&pipeline.config.staging_dir).map_err(OpenError::LoadStages)?;
        let failed = pipeline
            .verify_stages(&stages)
            .await
            .map_err(OpenError::Restore)?;
        if failed.is_empty() {
            pipeline.restore(&stages).await.map_err(OpenError::Restore)?;
            pipeline.transformation_occurred = true;
        }

        tracing::info!(
            stages = stages.len(),
            transformation_occurred = pipeline.transformation_occurred,
            overlay_views = pipeline.view_table_association.len(),
            "pipeline_opened"
        );
        Ok(pipeline)
    }

    /// Rebuild the overlay association and log list from what exists in the warehouse.
    async fn restore(&mut self, stages: &[StageConfig]) -> Result<(), StoreError> {
        let views: BTreeSet<String> = self
            .store
            .views(Database::Warehouse)
            .await?
            .into_iter()
            .collect();
        let tables: BTreeSet<String> = self
            .store
            .tables(Database::Warehouse)
            .await?
            .into_iter()
            .collect();

        for datamart in stages.iter().flat_map(|stage| &stage.datamarts) {
            let view = overlay_view_name(&datamart.to_view);
            if views.contains(&view) {
                self.view_table_association
                    .insert(view, datamart.to_view.clone());
            }
            let log_table = self.layout.log_table_for(&datamart.to_view);
            if tables.contains(&log_table) {
                self.register_log_table(log_table);
            }
        }
        Ok(())
    }

    /// Create the core tables and capture their protected columns.
    pub async fn bootstrap(&mut self) -> Result<Vec<CoreTableConfig>, BootstrapError> {
        bootstrap_core_schema(&self.store, &mut self.cache, &self.config.core_dir).await
    }

    /// Run every configured stage in dependency order.
    #[tracing::instrument(skip_all, err)]
    pub async fn run_all_transformations(&mut self) -> Result<RunReport, RunError> {
        let stages = discover_stages(&self.config.staging_dir).map_err(RunError::LoadStages)?;
        self.run(stages).await
    }

    /// Run the single stage named `stage_name`.
    ///
    /// Its datasources must already exist in the raw database.
    #[tracing::instrument(skip_all, fields(stage = %stage_name), err)]
    pub async fn run_transformation(&mut self, stage_name: &str) -> Result<RunReport, RunError> {
        let stage = discover_stages(&self.config.staging_dir)
            .map_err(RunError::LoadStages)?
            .into_iter()
            .find(|stage| stage.name == stage_name)
            .ok_or_else(|| RunError::UnknownStage {
                stage: stage_name.to_string(),
            })?;
        self.run(vec![stage]).await
    }

    async fn run(&mut self, stages: Vec<StageConfig>) -> Result<RunReport, RunError> {
        let base = self.raw_relations().await?;
        let ordered = order_stages(stages, &base).map_err(|err| {
            tracing::error!(
                error = %err,
                error_source = monitoring::logging::error_source(&err),
                "stage_ordering_failed"
            );
            RunError::Order(err)
        })?;
        tracing::info!(
            "stage execution order:\n{}",
            render_stage_order(&ordered)
        );

        let mut report = RunReport::default();
        for stage in &ordered {
            let stage_report = self.run_stage(stage).await.map_err(|err| {
                tracing::error!(
                    stage = %stage.name,
                    error = %err,
                    error_source = monitoring::logging::error_source(&err),
                    "stage_failed"
                );
                RunError::Stage {
                    stage: stage.name.clone(),
                    source: err,
                }
            })?;
            report.stages.push(stage_report);
        }

        report.failed_verification = self
            .verify_stages(&ordered)
            .await
            .map_err(RunError::Verify)?;
        self.transformation_occurred = report.is_verified();

        tracing::info!(
            stages = report.stages.len(),
            failed_verification = report.failed_verification.len(),
            "transformation_completed"
        );
        Ok(report)
    }

    async fn raw_relations(&self) -> Result<BTreeSet<String>, RunError> {
        let tables = self
            .store
            .tables(Database::Raw)
            .await
            .map_err(RunError::ListRawRelations)?;
        let views = self
            .store
            .views(Database::Raw)
            .await
            .map_err(RunError::ListRawRelations)?;
        Ok(tables.into_iter().chain(views).collect())
    }

    async fn run_stage(&mut self, stage: &StageConfig) -> Result<StageReport, StageError> {
        tracing::info!(stage = %stage.name, files = stage.staging_files.len(), "stage_started");

        for file in &stage.staging_files {
            let path = stage.staging_file_path(&self.config.staging_dir, file);
            self.execute_staging_file(&path).await?;
        }

        let mut stage_map = BTreeMap::new();
        let mut datamarts = Vec::with_capacity(stage.datamarts.len());
        for datamart in &stage.datamarts {
            stage_map.insert(datamart.from_view.clone(), datamart.to_view.clone());

            let promotion = promote(
                &self.store,
                &mut self.cache,
                datamart,
                &stage_map,
                self.config.type_drift,
            )
            .await
            .map_err(|err| StageError::Promote {
                datamart: datamart.to_string(),
                source: err,
            })?;
            let overlay_view = self.publish_overlay(&datamart.to_view).await?;

            datamarts.push(DatamartReport {
                datamart: datamart.clone(),
                promotion,
                overlay_view,
            });
        }

        tracing::info!(stage = %stage.name, datamarts = datamarts.len(), "stage_completed");
        Ok(StageReport {
            stage: stage.name.clone(),
            datamarts,
        })
    }

    async fn execute_staging_file(&mut self, path: &Path) -> Result<(), StageError> {
        if !path.is_file() {
            return Err(StageError::MissingStagingFile {
                path: path.to_path_buf(),
            });
        }

        let is_sql = path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("sql"));
        let script = if is_sql {
            read_staging_file(path)?
        } else if let Some(format) = TabularFormat::from_path(path) {
            self.compile_tabular(path, format).await?
        } else {
            return Err(StageError::UnsupportedStagingFile {
                path: path.to_path_buf(),
            });
        };

        let result = self.store.execute(Database::Raw, &script).await;
        self.cache.invalidate_database(Database::Raw);
        result.map_err(|err| StageError::ExecuteStagingFile {
            path: path.to_path_buf(),
            source: err,
        })?;
        tracing::info!(path = %path.display(), "staging_file_executed");
        Ok(())
    }

    async fn compile_tabular(
        &mut self,
        path: &Path,
        format: TabularFormat,
    ) -> Result<String, StageError> {
        let text = read_staging_file(path)?;
        let file_stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tabular_err = |err: TabularError| StageError::Tabular {
            path: path.to_path_buf(),
            source: err,
        };

        let plan = tabular::parse(&text, format, &file_stem).map_err(tabular_err)?;

        let mut schemas = BTreeMap::new();
        for table in plan.source_tables() {
            let columns = self
                .store
                .columns(Database::Raw, table)
                .await
                .map_err(|err| StageError::DescribeSource {
                    table_name: table.to_string(),
                    source: err,
                })?;
            if !columns.is_empty() {
                schemas.insert(
                    table.to_string(),
                    columns.into_iter().map(|column| column.name).collect(),
                );
            }
        }

        let views = plan.compile(&schemas).map_err(tabular_err)?;
        tracing::debug!(path = %path.display(), views = views.len(), "tabular_file_compiled");
        Ok(tabular::views_script(&views))
    }

    /// Ensure `table` has a log, then recreate and register its overlay view.
    async fn publish_overlay(&mut self, table: &str) -> Result<String, StageError> {
        let log_table = self.layout.log_table_for(table);
        validate_log_name(&log_table).map_err(|err| StageError::InvalidLogName {
            table_name: table.to_string(),
            source: err,
        })?;
        ensure_log_table(&self.store, &log_table)
            .await
            .map_err(|err| StageError::TransactionLog {
                log_table: log_table.clone(),
                source: err,
            })?;
        self.register_log_table(log_table.clone());

        let columns = self
            .store
            .columns(Database::Warehouse, table)
            .await
            .map_err(|err| StageError::CreateOverlay {
                table_name: table.to_string(),
                source: err,
            })?;
        let script =
            overlay_view_sql(table, &log_table, &columns).map_err(|err| StageError::Overlay {
                table_name: table.to_string(),
                source: err,
            })?;
        self.store
            .execute(Database::Warehouse, &script)
            .await
            .map_err(|err| StageError::CreateOverlay {
                table_name: table.to_string(),
                source: err,
            })?;

        let view = overlay_view_name(table);
        self.view_table_association
            .insert(view.clone(), table.to_string());
        tracing::info!(table = %table, view = %view, log_table = %log_table, "overlay_view_published");
        Ok(view)
    }

    fn register_log_table(&mut self, log_table: String) {
        if !self.transaction_tables.contains(&log_table) {
            self.transaction_tables.push(log_table);
        }
    }

    /// Check every configured datamart target exists and holds rows in the warehouse.
    ///
    /// Returns the targets that failed.
    pub async fn verify(&self) -> Result<Vec<String>, RunError> {
        let stages = discover_stages(&self.config.staging_dir).map_err(RunError::LoadStages)?;
        self.verify_stages(&stages).await.map_err(RunError::Verify)
    }

    async fn verify_stages(&self, stages: &[StageConfig]) -> Result<Vec<String>, StoreError> {
        let mut seen = BTreeSet::new();
        let mut failed = Vec::new();
        for datamart in stages.iter().flat_map(|stage| &stage.datamarts) {
            let target = datamart.to_view.as_str();
            if !seen.insert(target) {
                continue;
            }
            let exists = self
                .store
                .relation_exists(Database::Warehouse, target)
                .await?;
            let populated = exists && self.store.has_rows(Database::Warehouse, target).await?;
            if !populated {
                tracing::warn!(table = %target, exists, "datamart_verification_failed");
                failed.push(target.to_string());
            }
        }
        Ok(failed)
    }

    /// Overlay view name → warehouse table name, for every published overlay.
    pub fn view_table_association(&self) -> &BTreeMap<String, String> {
        &self.view_table_association
    }

    /// Transaction log tables known to exist, in registration order.
    pub fn transaction_tables(&self) -> &[String] {
        &self.transaction_tables
    }

    /// Whether the warehouse holds a verified transformation.
    pub fn transformation_occurred(&self) -> bool {
        self.transformation_occurred
    }

    /// Record an edit of `table` in its transaction log. Returns the new entry id.
    #[tracing::instrument(skip_all, fields(table = %table), err)]
    pub async fn append_log_entry(
        &mut self,
        table: &str,
        entry: &NewLogEntry,
    ) -> Result<i32, AppendLogEntryError> {
        let store_err = |err: StoreError| AppendLogEntryError::Store {
            table_name: table.to_string(),
            source: err,
        };

        let columns = self
            .store
            .columns(Database::Warehouse, table)
            .await
            .map_err(store_err)?;
        if columns.is_empty() {
            return Err(AppendLogEntryError::UnknownTable {
                table_name: table.to_string(),
            });
        }

        match &entry.target_column {
            Some(column) if !columns.iter().any(|info| &info.name == column) => {
                return Err(AppendLogEntryError::UnknownColumn {
                    table_name: table.to_string(),
                    column: column.clone(),
                });
            }
            None if entry.action != Action::Delete => {
                return Err(AppendLogEntryError::MissingColumn {
                    table_name: table.to_string(),
                    action: entry.action,
                });
            }
            _ => {}
        }

        let log_table = self.layout.log_table_for(table);
        validate_log_name(&log_table)?;
        ensure_log_table(&self.store, &log_table)
            .await
            .map_err(store_err)?;
        self.register_log_table(log_table.clone());

        let id = self
            .store
            .guard(
                Database::Warehouse,
                "append log entry",
                insert_entry(
                    self.store.pool(Database::Warehouse),
                    &log_table,
                    table,
                    entry,
                ),
            )
            .await
            .map_err(store_err)?;
        tracing::debug!(table = %table, log_table = %log_table, id, action = %entry.action, "log_entry_appended");
        Ok(id)
    }

    /// Create raw table `name` from `rows`. Returns the number of inserted rows.
    pub async fn create_table(
        &mut self,
        name: &str,
        rows: &[Row],
        primary_key: Option<&str>,
    ) -> Result<u64, IngestError> {
        let options = self.ingest_options();
        ingest::create_table(
            &self.store,
            &mut self.cache,
            options,
            name,
            rows,
            primary_key,
        )
        .await
    }

    /// Insert `rows` into the existing raw table `name`. Returns the number of inserted rows.
    pub async fn insert(&mut self, name: &str, rows: &[Row]) -> Result<u64, IngestError> {
        let options = self.ingest_options();
        ingest::insert(&self.store, &mut self.cache, options, name, rows).await
    }

    fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            infer_types: self.config.infer_types,
            drop_table_if_exists: self.config.drop_table_if_exists,
        }
    }

    pub async fn tables(&self, db: Database) -> Result<Vec<String>, StoreError> {
        self.store.tables(db).await
    }

    pub async fn views(&self, db: Database) -> Result<Vec<String>, StoreError> {
        self.store.views(db).await
    }

    /// Run one read query and return its rows as JSON objects.
    pub async fn query(
        &self,
        db: Database,
        statement: &str,
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        self.store.query(db, statement).await
    }

    /// Run statements that return no rows.
    pub async fn execute(&mut self, db: Database, statements: &str) -> Result<(), StoreError> {
        let result = self.store.execute(db, statements).await;
        self.cache.invalidate_database(db);
        result
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

fn read_staging_file(path: &Path) -> Result<String, StageError> {
    fs::read_to_string(path).map_err(|err| StageError::ReadStagingFile {
        path: path.to_path_buf(),
        source: err,
    })
}
