//! Health Check API Handler
//!
//! Liveness endpoint for monitoring.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::service::JobOrchestrator;

/// GET /health
/// Health check endpoint
pub async fn health_check(State(orchestrator): State<JobOrchestrator>) -> impl IntoResponse {
    tracing::trace!("Health check with {} active jobs", orchestrator.active_jobs().len());
    (StatusCode::OK, "OK")
}
