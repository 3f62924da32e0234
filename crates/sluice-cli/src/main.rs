mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Checkpointed streaming pipelines built from actor chains"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline until its operators finish or Ctrl-C
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Restore operators from the last committed checkpoint
        #[arg(long)]
        resume: bool,
    },
    /// Validate pipeline configuration and the state backend
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { pipeline, resume } => commands::run::execute(&pipeline, resume).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
    }
}
