use std::{path::Path, process::ExitCode};

use anyhow::{Context, Result};
use staging::core_tables::render_core_table_order;

use super::{load_config, open_pipeline};

pub async fn run(config_path: &Path) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let mut pipeline = open_pipeline(&config).await?;

    let tables = pipeline
        .bootstrap()
        .await
        .context("Failed to bootstrap the core schema")?;
    println!("Core tables:\n{}", render_core_table_order(&tables));
    Ok(ExitCode::SUCCESS)
}
