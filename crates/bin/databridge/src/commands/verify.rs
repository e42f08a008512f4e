use std::{path::Path, process::ExitCode};

use anyhow::{Context, Result};

use super::{load_config, open_pipeline};

pub async fn run(config_path: &Path) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let pipeline = open_pipeline(&config).await?;

    let failed = pipeline
        .verify()
        .await
        .context("Failed to verify datamarts")?;
    Ok(report_verification(&failed))
}

/// Print failed datamart targets and turn them into the process exit status.
pub fn report_verification(failed: &[String]) -> ExitCode {
    if failed.is_empty() {
        println!("All datamarts verified");
        return ExitCode::SUCCESS;
    }
    println!("Datamarts missing or empty in the warehouse:");
    for table in failed {
        println!("  - {table}");
    }
    ExitCode::FAILURE
}
