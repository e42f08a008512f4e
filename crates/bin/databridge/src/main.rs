use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use databridge::{Cli, Command, commands};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    monitoring::logging::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { stage } => commands::run::run(&cli.config, stage.as_deref()).await,
        Command::Bootstrap => commands::bootstrap::run(&cli.config).await,
        Command::Verify => commands::verify::run(&cli.config).await,
        Command::Order => commands::order::run(&cli.config),
        Command::NewStage { dir } => commands::new_stage::run(&dir),
    }
}
