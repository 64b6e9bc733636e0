//! Job-related API endpoints

use sandbox_core::domain::job::Job;
use sandbox_core::dto::job::{ExecutionReport, SubmitJob, SubmitResponse};

use crate::SandboxClient;
use crate::error::Result;
use crate::events::EventStream;

impl SandboxClient {
    /// Check that the orchestrator is up
    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        self.handle_empty_response(response).await
    }

    /// Run a script and wait for its report
    ///
    /// The request's `stream` flag is ignored; use [`submit`](Self::submit)
    /// and [`events`](Self::events) to stream.
    pub async fn run(&self, req: SubmitJob) -> Result<ExecutionReport> {
        let req = SubmitJob { stream: false, ..req };
        let response = self.client.post(self.url("/api/jobs")).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Submit a script for streaming
    ///
    /// The job starts once its events are requested.
    pub async fn submit(&self, req: SubmitJob) -> Result<SubmitResponse> {
        let req = SubmitJob { stream: true, ..req };
        let response = self.client.post(self.url("/api/jobs")).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Execute a submitted job and stream its messages
    pub async fn events(&self, job_id: &str) -> Result<EventStream> {
        let url = self.url(&format!("/api/jobs/{}/events", job_id));
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = self.check(response).await?;

        tracing::debug!("Streaming events of job {}", job_id);
        Ok(EventStream::new(job_id, response))
    }

    /// Get a pending or running job
    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let url = self.url(&format!("/api/jobs/{}", job_id));
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// List pending and running jobs
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let response = self.client.get(self.url("/api/jobs")).send().await?;

        self.handle_response(response).await
    }

    /// Cancel a job
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = self.url(&format!("/api/jobs/{}", job_id));
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
