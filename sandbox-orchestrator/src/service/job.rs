//! Job Registry
//!
//! In-memory store of the jobs the orchestrator knows about. A job enters on
//! submission and leaves once its terminal status has been recorded, so the
//! registry only ever holds pending and running jobs.

use sandbox_core::domain::job::{Job, JobStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

/// Error recorded for jobs stopped by a cancel request or a vanished consumer
pub const CANCELLED: &str = "cancelled";

/// Service error type
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("script must not be empty")]
    EmptyScript,

    #[error("script is {size} bytes, the limit is {limit} bytes")]
    ScriptTooLarge { size: usize, limit: usize },

    #[error("job {0} has already been executed")]
    AlreadyExecuted(String),
}

struct Entry {
    job: Job,
    executed: bool,
    cancel: Option<oneshot::Sender<()>>,
}

/// Shared map of live jobs
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, Entry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, job: Job) {
        self.lock().insert(
            job.id.clone(),
            Entry {
                job,
                executed: false,
                cancel: None,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().get(id).map(|entry| entry.job.clone())
    }

    /// Jobs that are pending or running, oldest first
    pub fn active(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().map(|entry| entry.job.clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Reserves a job for execution
    ///
    /// Returns the job together with the receiving end of its cancel signal.
    /// A job can be claimed once.
    pub fn claim(&self, id: &str) -> Result<(Job, oneshot::Receiver<()>), JobError> {
        let mut jobs = self.lock();
        let entry = jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if entry.executed {
            return Err(JobError::AlreadyExecuted(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        entry.executed = true;
        entry.cancel = Some(tx);
        Ok((entry.job.clone(), rx))
    }

    pub fn mark_running(&self, id: &str) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.job.mark_running();
        }
    }

    /// Records the terminal status and removes the job
    pub fn finish(&self, id: &str, status: JobStatus, error: Option<String>) -> Option<Job> {
        let mut entry = self.lock().remove(id)?;
        entry.job.finish(status, error);
        Some(entry.job)
    }

    /// Cancels a job
    ///
    /// A job that was never executed is finished on the spot. An executing
    /// job is signalled and its supervisor records the outcome.
    pub fn cancel(&self, id: &str) -> Result<(), JobError> {
        let mut jobs = self.lock();
        let entry = jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if !entry.executed {
            if let Some(mut entry) = jobs.remove(id) {
                entry
                    .job
                    .finish(JobStatus::Failed, Some(CANCELLED.to_string()));
            }
            tracing::info!("Job {} cancelled before execution", id);
            return Ok(());
        }

        if let Some(cancel) = entry.cancel.take() {
            // The supervisor may already be finishing
            let _ = cancel.send(());
            tracing::info!("Job {} cancellation requested", id);
        }
        Ok(())
    }
}

/// Checks a script against the size rules
pub fn validate_script(script: &str, limit: usize) -> Result<(), JobError> {
    if script.trim().is_empty() {
        return Err(JobError::EmptyScript);
    }

    if script.len() > limit {
        return Err(JobError::ScriptTooLarge {
            size: script.len(),
            limit,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job(script: &str) -> Job {
        Job::new(script, Duration::from_secs(1))
    }

    #[test]
    fn test_validate_script() {
        assert!(validate_script("console.log(1)", 100).is_ok());
        assert!(matches!(validate_script("", 100), Err(JobError::EmptyScript)));
        assert!(matches!(validate_script(" \n\t", 100), Err(JobError::EmptyScript)));
        assert!(matches!(
            validate_script("0123456789", 4),
            Err(JobError::ScriptTooLarge { size: 10, limit: 4 })
        ));
    }

    #[test]
    fn test_claim_once() {
        let registry = JobRegistry::new();
        let job = job("1");
        let id = job.id.clone();
        registry.insert(job);

        assert!(registry.claim(&id).is_ok());
        assert!(matches!(registry.claim(&id), Err(JobError::AlreadyExecuted(_))));
        assert!(matches!(registry.claim("missing"), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_finish_removes_job() {
        let registry = JobRegistry::new();
        let job = job("1");
        let id = job.id.clone();
        registry.insert(job);
        registry.mark_running(&id);
        assert_eq!(registry.get(&id).map(|j| j.status), Some(JobStatus::Running));

        let finished = registry.finish(&id, JobStatus::Completed, None).unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(finished.completed_at.is_some());
        assert!(registry.get(&id).is_none());
        assert!(registry.finish(&id, JobStatus::Failed, None).is_none());
    }

    #[test]
    fn test_cancel_pending_job() {
        let registry = JobRegistry::new();
        let job = job("1");
        let id = job.id.clone();
        registry.insert(job);

        registry.cancel(&id).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(registry.cancel(&id), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_cancel_executing_job_signals_once() {
        let registry = JobRegistry::new();
        let job = job("1");
        let id = job.id.clone();
        registry.insert(job);

        let (_, mut cancelled) = registry.claim(&id).unwrap();
        registry.cancel(&id).unwrap();
        registry.cancel(&id).unwrap();

        assert!(cancelled.try_recv().is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_active_jobs_oldest_first() {
        let registry = JobRegistry::new();
        let first = job("1");
        let second = job("2");
        let ids = vec![first.id.clone(), second.id.clone()];
        registry.insert(second);
        registry.insert(first);

        let active: Vec<String> = registry.active().into_iter().map(|j| j.id).collect();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|id| ids.contains(id)));
    }
}
