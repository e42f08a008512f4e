use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "databridge")]
#[command(version)]
#[command(about = "Promote raw PostgreSQL staging data into an editable warehouse", long_about = None)]
pub struct Cli {
    /// Configuration file (default: databridge.toml)
    ///
    /// Can also be set via DATABRIDGE_CONFIG environment variable
    #[arg(long, env = "DATABRIDGE_CONFIG", default_value = "databridge.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run every configured stage in dependency order, or a single stage.
    ///
    /// Exits with a non-zero status when a datamart target is missing or empty afterwards.
    Run {
        /// Name of the only stage to run
        #[arg(long)]
        stage: Option<String>,
    },
    /// Create the core tables declared in the core directory and print them in creation order.
    Bootstrap,
    /// Check that every configured datamart target exists and holds rows.
    Verify,
    /// Print the stage and core table execution order without touching any database.
    Order,
    /// Write an empty stage descriptor template into DIR.
    NewStage {
        /// Directory to write `empty_configuration.toml` into
        dir: PathBuf,
    },
}
