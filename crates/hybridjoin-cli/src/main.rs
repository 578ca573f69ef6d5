mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "hybridjoin",
    version,
    about = "Bounded-memory streaming join into a star-schema warehouse"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream the event file through both join stages into the fact table
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Validate pipeline configuration and warehouse connectivity
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format == LogFormat::Json);

    match cli.command {
        Commands::Run { pipeline } => commands::run::execute(&pipeline).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
    }
}
