use std::{path::Path, process::ExitCode};

use anyhow::{Context, Result};
use warehouse::{Promotion, RunReport};

use super::{load_config, open_pipeline, verify::report_verification};

pub async fn run(config_path: &Path, stage: Option<&str>) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let mut pipeline = open_pipeline(&config).await?;

    let report = match stage {
        Some(stage) => pipeline
            .run_transformation(stage)
            .await
            .with_context(|| format!("Failed to run stage '{stage}'"))?,
        None => pipeline
            .run_all_transformations()
            .await
            .context("Failed to run transformations")?,
    };

    print_report(&report);
    Ok(report_verification(&report.failed_verification))
}

fn print_report(report: &RunReport) {
    for stage in &report.stages {
        println!("Stage {}", stage.stage);
        for datamart in &stage.datamarts {
            let outcome = match &datamart.promotion {
                Promotion::Created { rows, primary_key, .. } => {
                    format!("created with {rows} rows, primary key {}", primary_key.column())
                }
                Promotion::Merged {
                    rows,
                    added_columns,
                    upsert,
                } => {
                    let mode = if *upsert { "upserted" } else { "appended" };
                    if added_columns.is_empty() {
                        format!("{mode} {rows} rows")
                    } else {
                        format!(
                            "{mode} {rows} rows, added {}",
                            added_columns.join(", ")
                        )
                    }
                }
            };
            println!(
                "  {} -> {} ({outcome}), overlay {}",
                datamart.datamart.from_view, datamart.datamart.to_view, datamart.overlay_view
            );
        }
    }
}
