//! Sandbox Worker
//!
//! Runs exactly one job in an isolated QuickJS sandbox, then exits.
//!
//! Protocol:
//! - stdin: one JSON `WorkerRequest`, closed by the host after writing
//! - stdout: NDJSON `Message`s, ending with the terminal `status`
//! - stderr: this process's own tracing output
//!
//! The worker is never reused; the host spawns a fresh process per job.

mod config;
mod executor;
mod imports;
mod sinks;

use anyhow::{Context, Result};
use sandbox_core::protocol::decode_request;
use std::io::Read;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::executor::ScriptExecutor;
use crate::sinks::StdoutSink;

fn main() -> ExitCode {
    // Stdout is the message channel, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox_worker=info,sandbox_js=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Worker failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config = load_config()?;

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read request from stdin")?;
    let request = decode_request(&input).context("Invalid worker request")?;

    info!(
        "Starting job {} (timeout {} ms, testing {})",
        request.job_id, request.timeout_ms, request.testing
    );

    ScriptExecutor::new(config).execute(request, StdoutSink::stdout());
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
