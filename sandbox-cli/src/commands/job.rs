//! Job command handlers
//!
//! Submits, inspects, watches and cancels jobs on a sandbox server.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use sandbox_client::SandboxClient;

use super::ScriptArgs;
use super::run::{finish, submission, watch};
use crate::config::Config;
use crate::output::{print_job_details, print_job_summary};

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// List pending and running jobs
    List,
    /// Submit a script without running it yet
    Submit {
        #[command(flatten)]
        script: ScriptArgs,
    },
    /// Run a submitted job and stream its output
    Watch {
        /// Job ID
        id: String,
    },
    /// Get job details
    Get {
        /// Job ID
        id: String,
    },
    /// Cancel a job
    Cancel {
        /// Job ID
        id: String,
    },
}

/// Handle job commands
///
/// Routes job subcommands to their respective handlers.
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = SandboxClient::new(&config.server_url);

    match command {
        JobCommands::List => list_jobs(&client).await,
        JobCommands::Submit { script } => submit_job(&client, &script).await,
        JobCommands::Watch { id } => finish(watch(&client, &id).await?),
        JobCommands::Get { id } => get_job(&client, &id).await,
        JobCommands::Cancel { id } => cancel_job(&client, &id).await,
    }
}

/// List active jobs
async fn list_jobs(client: &SandboxClient) -> Result<()> {
    let jobs = client.list_jobs().await?;

    if jobs.is_empty() {
        println!("{}", "No active jobs.".yellow());
    } else {
        println!("{}", format!("Found {} active job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

/// Submit a job for later streaming
async fn submit_job(client: &SandboxClient, args: &ScriptArgs) -> Result<()> {
    let submitted = client.submit(submission(args)?).await?;

    println!("{} Job submitted", "✓".green());
    println!("  ID:     {}", submitted.job_id.cyan());
    println!("  Events: {}{}", client.base_url(), submitted.events_url);

    Ok(())
}

/// Get and display a single job
async fn get_job(client: &SandboxClient, id: &str) -> Result<()> {
    match client.get_job(id).await {
        Ok(job) => {
            print_job_details(&job);
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            println!("{}", format!("Job {} is not active.", id).yellow());
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Cancel a job
async fn cancel_job(client: &SandboxClient, id: &str) -> Result<()> {
    client.cancel_job(id).await?;
    println!("{} Job {} cancelled", "✓".green(), id);
    Ok(())
}
