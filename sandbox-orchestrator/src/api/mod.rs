//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific concern.

pub mod error;
pub mod health;
pub mod job;
pub mod stream;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::JobOrchestrator;

/// Create the main API router with all endpoints
pub fn create_router(orchestrator: JobOrchestrator) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/api/jobs", post(job::submit_job).get(job::list_active_jobs))
        .route("/api/jobs/{id}", get(job::get_job).delete(job::cancel_job))
        .route("/api/jobs/{id}/events", get(stream::job_events))
        // Add state and middleware
        .with_state(orchestrator)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
