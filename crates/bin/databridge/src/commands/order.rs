//! Offline execution order.
//!
//! Every datasource that no stage produces is assumed to exist in the raw database, so the
//! order can be printed without connecting anywhere.

use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
    process::ExitCode,
};

use anyhow::{Context, Result};
use staging::{
    StageConfig,
    core_tables::{load_core_tables, order_core_tables, render_core_table_order},
    stage::{discover_stages, order_stages, render_stage_order},
};

use super::load_config;

pub fn run(config_path: &Path) -> Result<ExitCode> {
    let config = load_config(config_path)?;

    let core_tables = load_core_tables(&config.pipeline.core_dir)
        .context("Failed to load core table descriptors")?;
    let core_tables = order_core_tables(core_tables).context("Failed to order core tables")?;

    let stages = discover_stages(&config.pipeline.staging_dir)
        .context("Failed to load stage descriptors")?;
    let base = external_sources(&stages);
    let stages = order_stages(stages, &base).context("Failed to order stages")?;

    println!("Core tables:\n{}", render_core_table_order(&core_tables));
    println!("Stages:\n{}", render_stage_order(&stages));
    Ok(ExitCode::SUCCESS)
}

/// Datasources not produced by any stage.
pub fn external_sources(stages: &[StageConfig]) -> BTreeSet<String> {
    let produced: HashSet<&str> = stages
        .iter()
        .flat_map(StageConfig::produced_resources)
        .collect();
    stages
        .iter()
        .flat_map(|stage| &stage.datasources)
        .filter(|source| !produced.contains(source.as_str()))
        .cloned()
        .collect()
}
