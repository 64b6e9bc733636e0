//! Streaming adapter
//!
//! Serves a job's messages as server-sent events: the event id is the
//! message id, the event name its type and the data its JSON payload. The
//! response ends a short grace period after the terminal status. If the
//! client disconnects first, the dropped stream stops the worker.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, stream};
use sandbox_core::domain::message::Message;
use std::convert::Infallible;
use std::time::Duration;

use crate::api::error::ApiResult;
use crate::service::{JobOrchestrator, JobStream};

/// GET /api/jobs/{id}/events
/// Execute a submitted job and stream its messages
pub async fn job_events(
    State(orchestrator): State<JobOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let jobs = orchestrator.execute(&id)?;
    tracing::info!("Streaming events of job {}", id);

    Ok(into_sse(jobs, orchestrator.config().stream_grace))
}

/// Converts a message into its SSE event
pub fn to_event(message: &Message) -> Event {
    let data = serde_json::to_string(&message.payload).unwrap_or_else(|_| "null".to_string());
    Event::default()
        .id(message.message_id.to_string())
        .event(message.message_type.as_str())
        .data(data)
}

/// Wraps a job stream as an SSE response
pub fn into_sse(
    jobs: JobStream,
    grace: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(events(jobs, grace)).keep_alive(KeepAlive::default())
}

fn events(jobs: JobStream, grace: Duration) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(jobs), move |jobs| async move {
        let Some(mut jobs) = jobs else {
            tokio::time::sleep(grace).await;
            return None;
        };

        let message = jobs.next().await?;
        let event = to_event(&message);
        let next = if message.is_terminal() { None } else { Some(jobs) };
        Some((Ok(event), next))
    })
}
