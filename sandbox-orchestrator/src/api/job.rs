//! Job API Handlers
//!
//! HTTP endpoints for submitting, inspecting and cancelling jobs.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sandbox_core::domain::job::Job;
use sandbox_core::dto::job::{SubmitJob, SubmitResponse};

use crate::api::error::{ApiError, ApiResult};
use crate::service::JobOrchestrator;

/// POST /api/jobs
/// Submit a script
///
/// Streaming submissions return `202` with the events URL and run once the
/// events are requested. Other submissions run right away and answer with
/// the full execution report.
pub async fn submit_job(
    State(orchestrator): State<JobOrchestrator>,
    Json(req): Json<SubmitJob>,
) -> ApiResult<Response> {
    if req.stream {
        let job_id = orchestrator.submit(req)?;
        tracing::info!("Streaming job submitted: {}", job_id);

        let events_url = format!("/api/jobs/{}/events", job_id);
        let body = SubmitResponse { job_id, events_url };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let report = orchestrator.run_buffered(req).await?;
    tracing::info!("Job {} finished: {}", report.job_id, report.status);
    Ok((StatusCode::OK, Json(report)).into_response())
}

/// GET /api/jobs
/// List pending and running jobs
pub async fn list_active_jobs(State(orchestrator): State<JobOrchestrator>) -> Json<Vec<Job>> {
    tracing::debug!("Listing active jobs");
    Json(orchestrator.active_jobs())
}

/// GET /api/jobs/{id}
/// Get a live job by ID
pub async fn get_job(
    State(orchestrator): State<JobOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    orchestrator
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))
}

/// DELETE /api/jobs/{id}
/// Cancel a job
pub async fn cancel_job(
    State(orchestrator): State<JobOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling job: {}", id);

    orchestrator.cancel(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
