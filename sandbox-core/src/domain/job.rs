//! Job domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A single request to run one script in one worker
///
/// Created on submission and mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub script: String,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub timeout_ms: u64,
    pub error: Option<String>,
    /// Value handed to the script's returned function (function mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Whether the test harness is installed for this job
    #[serde(default)]
    pub testing: bool,
}

impl Job {
    /// Creates a pending job with a freshly generated identifier
    pub fn new(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: Self::generate_id(),
            script: script.into(),
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
            completed_at: None,
            timeout_ms: timeout.as_millis() as u64,
            error: None,
            input: None,
            testing: false,
        }
    }

    /// Generates an opaque job identifier
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn with_input(mut self, input: Option<serde_json::Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_testing(mut self, testing: bool) -> Self {
        self.testing = testing;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Moves a pending job to running
    ///
    /// Returns false if the job was not pending.
    pub fn mark_running(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        true
    }

    /// Records the terminal status of the job
    ///
    /// A job reaches a terminal status exactly once; later calls are ignored
    /// and return false.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(chrono::Utc::now());
        true
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    /// Completed, failed and timeout end a job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new("console.log(1)", Duration::from_secs(2));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.timeout_ms, 2000);
        assert_eq!(job.id.len(), 32);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Job::generate_id(), Job::generate_id());
    }

    #[test]
    fn test_terminal_status_is_recorded_once() {
        let mut job = Job::new("x", Duration::from_secs(1));
        assert!(job.mark_running());
        assert!(!job.mark_running());

        assert!(job.finish(JobStatus::Timeout, Some("slow".to_string())));
        assert!(!job.finish(JobStatus::Completed, None));

        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.error.as_deref(), Some("slow"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_finish_rejects_non_terminal_status() {
        let mut job = Job::new("x", Duration::from_secs(1));
        assert!(!job.finish(JobStatus::Running, None));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&JobStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let status: JobStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }
}
