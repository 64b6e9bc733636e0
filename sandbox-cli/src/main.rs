//! Sandbox CLI
//!
//! Command-line interface for running scripts in the sandbox, either through
//! a sandbox server or locally with an in-process orchestrator.

mod commands;
mod config;
mod output;
mod script;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sandbox")]
#[command(about = "Sandboxed JavaScript execution CLI", long_about = None)]
struct Cli {
    /// Sandbox server URL
    #[arg(long, env = "SANDBOX_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Worker binary used by `run --local`
    #[arg(long, env = "SANDBOX_WORKER_BIN")]
    worker_bin: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        server_url: cli.server_url,
        worker_bin: cli.worker_bin,
    };

    handle_command(cli.command, &config).await
}
