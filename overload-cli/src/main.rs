//! Overload CLI - starts the simulator and its web dashboard.

use std::path::PathBuf;

use clap::Parser;
use overload_core::tracing_setup::{init_tracing, CliLogLevel};

#[derive(Parser)]
#[command(name = "overload")]
#[command(about = "Interactive client/server request-policy simulator")]
struct Cli {
    /// Port for the dashboard and API
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Console log level (full debug logs always go to the logs directory)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for debug log files
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    tracing::info!("client/server simulation starting");
    overload_web::run_server(cli.port).await
}
