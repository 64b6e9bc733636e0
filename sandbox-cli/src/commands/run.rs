//! Run command
//!
//! Streams a script's messages to the terminal as they arrive, from a server
//! or from an orchestrator running inside the CLI process.

use anyhow::{Context, Result, bail};
use colored::*;
use sandbox_client::SandboxClient;
use sandbox_core::domain::job::JobStatus;
use sandbox_core::domain::message::Message;
use sandbox_core::dto::job::SubmitJob;
use sandbox_orchestrator::JobOrchestrator;

use super::ScriptArgs;
use crate::config::Config;
use crate::output::print_message;
use crate::script::{parse_input, read_script};

/// Builds the submission for a script
pub fn submission(args: &ScriptArgs) -> Result<SubmitJob> {
    Ok(SubmitJob {
        script: read_script(&args.file)?,
        stream: true,
        input: parse_input(args.input.as_deref())?,
        testing: args.testing,
        timeout_ms: args.timeout_ms,
    })
}

pub async fn handle_run(args: ScriptArgs, local: bool, config: &Config) -> Result<()> {
    let req = submission(&args)?;

    let status = if local {
        run_local(req, config).await?
    } else {
        run_remote(req, config).await?
    };

    finish(status)
}

/// Fails the command unless the job completed
pub fn finish(status: Option<JobStatus>) -> Result<()> {
    match status {
        Some(JobStatus::Completed) => Ok(()),
        Some(status) => bail!("job ended with status {}", status),
        None => bail!("job stream ended without a terminal status"),
    }
}

async fn run_remote(req: SubmitJob, config: &Config) -> Result<Option<JobStatus>> {
    let client = SandboxClient::new(&config.server_url);
    let submitted = client.submit(req).await.context("Failed to submit job")?;
    println!("{}", format!("Job {}", submitted.job_id).dimmed());

    watch(&client, &submitted.job_id).await
}

/// Streams the events of a submitted job
pub async fn watch(client: &SandboxClient, job_id: &str) -> Result<Option<JobStatus>> {
    let mut events = client
        .events(job_id)
        .await
        .with_context(|| format!("Failed to stream job {}", job_id))?;

    let mut status = None;
    while let Some(message) = events.next().await {
        status = show(&message?).or(status);
    }
    Ok(status)
}

async fn run_local(req: SubmitJob, config: &Config) -> Result<Option<JobStatus>> {
    let mut orchestrator_config = sandbox_orchestrator::Config::from_env()?;
    if let Some(worker_bin) = &config.worker_bin {
        orchestrator_config.worker_bin = worker_bin.clone();
    }
    orchestrator_config.validate()?;

    let orchestrator = JobOrchestrator::new(orchestrator_config);
    let job_id = orchestrator.submit(req)?;
    let mut stream = orchestrator.execute(&job_id)?;

    let mut status = None;
    while let Some(message) = stream.next_message().await {
        status = show(&message).or(status);
    }
    Ok(status)
}

/// Prints a message and returns the terminal status it carries
fn show(message: &Message) -> Option<JobStatus> {
    print_message(message);
    message
        .status_report()
        .map(|report| report.status)
        .filter(JobStatus::is_terminal)
}
