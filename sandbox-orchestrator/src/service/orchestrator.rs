//! Job Orchestrator
//!
//! Entry point for running scripts: submit a job, execute it to get its
//! message stream, cancel it, or run it buffered and get a summary.

use sandbox_core::domain::env::EnvSnapshot;
use sandbox_core::domain::job::Job;
use sandbox_core::domain::message::{Message, StatusReport};
use sandbox_core::dto::job::{ExecutionReport, SubmitJob};
use sandbox_core::protocol::WorkerRequest;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};

use super::job::{JobError, JobRegistry, validate_script};
use super::stream::JobStream;
use super::supervisor::Supervisor;
use crate::config::Config;

/// Messages buffered between a supervisor and a slow consumer
const STREAM_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct JobOrchestrator {
    config: Arc<Config>,
    registry: JobRegistry,
    permits: Arc<Semaphore>,
}

impl JobOrchestrator {
    pub fn new(config: Config) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            config: Arc::new(config),
            registry: JobRegistry::new(),
            permits,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates and stores a new pending job
    ///
    /// Returns the job id; nothing runs until [`execute`](Self::execute).
    pub fn submit(&self, req: SubmitJob) -> Result<String, JobError> {
        validate_script(&req.script, self.config.max_script_bytes)?;

        let job = Job::new(req.script, self.config.timeout_for(req.timeout_ms))
            .with_input(req.input)
            .with_testing(req.testing);
        let id = job.id.clone();
        self.registry.insert(job);

        tracing::info!("Job submitted: {}", id);
        Ok(id)
    }

    /// Starts a submitted job and returns its message stream
    ///
    /// Must be called from within a tokio runtime. A job executes once.
    pub fn execute(&self, job_id: &str) -> Result<JobStream, JobError> {
        let (job, cancel) = self.registry.claim(job_id)?;
        let timeout = job.timeout();
        let request = self.worker_request(job);

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let supervisor = Supervisor::new(
            Arc::clone(&self.config),
            self.registry.clone(),
            Arc::clone(&self.permits),
        );
        tokio::spawn(supervisor.run(request, timeout, tx, cancel));

        tracing::info!("Job {} executing", job_id);
        Ok(JobStream::new(job_id.to_string(), rx))
    }

    pub fn cancel(&self, job_id: &str) -> Result<(), JobError> {
        self.registry.cancel(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.registry.get(job_id)
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        self.registry.active()
    }

    /// Submits and executes a job, waiting for all of its messages
    ///
    /// Collects at most `max_buffered_bytes` of payload. A job that prints
    /// more is stopped and reported as failed with the output so far.
    pub async fn run_buffered(&self, req: SubmitJob) -> Result<ExecutionReport, JobError> {
        let job_id = self.submit(req)?;
        let mut stream = self.execute(&job_id)?;
        let limit = self.config.max_buffered_bytes;

        let mut messages = Vec::new();
        let mut buffered = 0;
        while let Some(message) = stream.next_message().await {
            if !message.is_terminal() {
                buffered += payload_size(&message);
                if buffered > limit {
                    tracing::warn!("Job {} output exceeded {} bytes, stopping it", job_id, limit);
                    // Dropping the stream kills the worker
                    drop(stream);

                    let next_id = messages.last().map_or(1, |m: &Message| m.message_id + 1);
                    let report = StatusReport::failed(format!("output exceeded {} bytes", limit));
                    messages.push(Message::status(&job_id, next_id, &report));
                    return Ok(ExecutionReport::from_messages(job_id, messages));
                }
            }
            messages.push(message);
        }

        Ok(ExecutionReport::from_messages(job_id, messages))
    }

    fn worker_request(&self, job: Job) -> WorkerRequest {
        let node_env = if job.testing { "testing" } else { "development" };
        let env = EnvSnapshot::capture(&self.config.env_allow).with_var("NODE_ENV", node_env);

        WorkerRequest {
            job_id: job.id,
            script: job.script,
            env,
            timeout_ms: job.timeout_ms,
            input: job.input,
            testing: job.testing,
            allow_network: self.config.allow_network,
            limits: self.config.limits,
        }
    }
}

fn payload_size(message: &Message) -> usize {
    match &message.payload {
        serde_json::Value::String(text) => text.len(),
        other => other.to_string().len(),
    }
}
