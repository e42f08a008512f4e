//! One module per subcommand, plus the setup they share.

use std::path::Path;

use anyhow::{Context, Result};
use config::Config;
use tokio_util::sync::CancellationToken;
use warehouse::Pipeline;

pub mod bootstrap;
pub mod new_stage;
pub mod order;
pub mod run;
pub mod verify;

pub fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    tracing::info!(config = %config.config_path.display(), "config_loaded");
    Ok(config)
}

/// Open the pipeline with a cancellation token wired to Ctrl+C.
pub async fn open_pipeline(config: &Config) -> Result<Pipeline> {
    let cancel = cancel_on_ctrl_c();
    Pipeline::open(config, cancel)
        .await
        .context("Failed to open the pipeline")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("ctrl_c_received");
                cancel.cancel();
            }
            Err(err) => tracing::error!(error = %err, "ctrl_c_listener_failed"),
        }
    });
    token
}
