use std::{path::Path, process::ExitCode};

use anyhow::{Context, Result};

pub fn run(dir: &Path) -> Result<ExitCode> {
    let path = staging::stage::write_empty_configuration(dir)
        .with_context(|| format!("Failed to write a stage template into {}", dir.display()))?;
    println!("Created {}", path.display());
    Ok(ExitCode::SUCCESS)
}
