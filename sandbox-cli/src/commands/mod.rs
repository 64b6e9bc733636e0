//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod run;
mod types;

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

/// Script options shared by `run` and `job submit`
#[derive(Args, Debug, Clone)]
pub struct ScriptArgs {
    /// Script file, or `-` for stdin
    pub file: PathBuf,

    /// Install the `test`/`expect` harness
    #[arg(long)]
    pub testing: bool,

    /// JSON passed to a script that returns a function; `@file` reads it from a file
    #[arg(long)]
    pub input: Option<String>,

    /// Job timeout in milliseconds (server default when omitted)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a script and stream its output
    Run {
        #[command(flatten)]
        script: ScriptArgs,

        /// Run with an in-process orchestrator instead of a server
        #[arg(long)]
        local: bool,
    },
    /// Job management
    Job {
        #[command(subcommand)]
        command: job::JobCommands,
    },
    /// Print the TypeScript declarations of the sandbox globals
    Types {
        /// Include the test harness
        #[arg(long)]
        testing: bool,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run { script, local } => run::handle_run(script, local, config).await,
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::Types { testing } => {
            types::print_types(testing);
            Ok(())
        }
    }
}
