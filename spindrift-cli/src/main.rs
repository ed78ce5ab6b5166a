//! Spindrift CLI - Command-line interface
//!
//! Provides command-line access to the transcoding streaming server.

mod commands;

use clap::Parser;
use spindrift_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "spindrift")]
#[command(about = "Transcoding session manager and segmented streaming server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level; full debug output always goes to the log file
    #[arg(long, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), None)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command).await
}
