//! Server-sent event streams
//!
//! The orchestrator streams job messages as SSE: the event id is the message
//! id, the event name the message type and the data the JSON payload.
//! Parsing is left to `eventsource-stream`; this module turns its events
//! back into [`Message`]s.

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::StreamExt;
use futures::stream::BoxStream;
use sandbox_core::domain::message::{Message, MessageType};

use crate::error::{ClientError, Result};

type Events = BoxStream<'static, std::result::Result<Event, EventStreamError<reqwest::Error>>>;

/// Rebuilds the job message an event carries
pub fn message_from_event(event: &Event, job_id: &str) -> Result<Message> {
    let name = if event.event.is_empty() { "message" } else { event.event.as_str() };
    let message_type = MessageType::from_name(name)
        .ok_or_else(|| ClientError::ParseError(format!("unknown event type '{}'", name)))?;

    let message_id = event
        .id
        .parse::<u64>()
        .map_err(|e| ClientError::ParseError(format!("invalid event id '{}': {}", event.id, e)))?;

    let payload = serde_json::from_str(&event.data)
        .map_err(|e| ClientError::ParseError(format!("invalid event data: {}", e)))?;

    Ok(Message::new(job_id, message_id, message_type, payload))
}

impl From<EventStreamError<reqwest::Error>> for ClientError {
    fn from(err: EventStreamError<reqwest::Error>) -> Self {
        match err {
            EventStreamError::Transport(err) => ClientError::RequestFailed(err),
            other => ClientError::ParseError(other.to_string()),
        }
    }
}

/// Messages of one streamed job
///
/// Ends after the terminal status, without waiting for the server to close
/// the connection.
pub struct EventStream {
    job_id: String,
    events: Events,
    done: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("job_id", &self.job_id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    pub(crate) fn new(job_id: impl Into<String>, response: reqwest::Response) -> Self {
        Self::from_events(job_id, response.bytes_stream().eventsource().boxed())
    }

    fn from_events(job_id: impl Into<String>, events: Events) -> Self {
        Self {
            job_id: job_id.into(),
            events,
            done: false,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next message, or `None` once the job has ended
    pub async fn next(&mut self) -> Option<Result<Message>> {
        if self.done {
            return None;
        }

        match self.events.next().await {
            Some(Ok(event)) => {
                let message = message_from_event(&event, &self.job_id);
                if matches!(&message, Ok(m) if m.is_terminal()) {
                    self.done = true;
                }
                Some(message)
            }
            Some(Err(err)) => {
                self.done = true;
                Some(Err(err.into()))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Reads every remaining message
    pub async fn collect(mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await {
            messages.push(message?);
        }
        Ok(messages)
    }
}
