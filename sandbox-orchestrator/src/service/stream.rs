//! Job message stream
//!
//! The consumer end of a supervised job. Dropping it tells the supervisor
//! nobody is listening any more, and the worker is killed.

use futures::Stream;
use sandbox_core::domain::message::Message;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Ordered messages of one job, ending after its terminal status
#[derive(Debug)]
pub struct JobStream {
    job_id: String,
    receiver: mpsc::Receiver<Message>,
}

impl JobStream {
    pub(crate) fn new(job_id: String, receiver: mpsc::Receiver<Message>) -> Self {
        Self { job_id, receiver }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next message, or `None` once the supervisor is done
    pub async fn next_message(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Stream for JobStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.receiver.poll_recv(cx)
    }
}
