//! Worker side of the message channel
//!
//! Capabilities post through a shared [`Channel`]. The channel numbers
//! messages, hands them to a [`MessageSink`], and enforces the closing rules:
//! once closed it drops every post, and the terminal status can be sent
//! exactly once, after which the channel is sealed.

use sandbox_core::domain::error::SerializedError;
use sandbox_core::domain::message::{Message, MessageType, StatusReport};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;

/// Trait for message sinks
///
/// The worker writes to stdout; tests collect into memory.
pub trait MessageSink {
    fn write(&mut self, message: &Message);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Open,
    Closed,
    Sealed,
}

struct Inner {
    job_id: String,
    next_id: u64,
    state: ChannelState,
    first_exception: Option<String>,
    sink: Box<dyn MessageSink>,
}

impl Inner {
    fn emit(&mut self, message_type: MessageType, payload: JsonValue) {
        let message = Message::new(self.job_id.clone(), self.next_id, message_type, payload);
        self.next_id += 1;
        self.sink.write(&message);
    }
}

/// Shared handle to the message channel of one job
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<Inner>>,
}

impl Channel {
    pub fn new<S: MessageSink + 'static>(job_id: impl Into<String>, sink: S) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                job_id: job_id.into(),
                next_id: 1,
                state: ChannelState::Open,
                first_exception: None,
                sink: Box::new(sink),
            })),
        }
    }

    pub fn job_id(&self) -> String {
        self.inner.borrow().job_id.clone()
    }

    /// Posts a message
    ///
    /// Returns false if the channel is no longer open and the message was
    /// dropped.
    pub fn post(&self, message_type: MessageType, payload: JsonValue) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.state != ChannelState::Open {
            return false;
        }
        inner.emit(message_type, payload);
        true
    }

    /// Posts an `exception` message and remembers the first one posted
    pub fn post_exception(&self, error: &SerializedError) -> bool {
        let posted = self.post(MessageType::Exception, error.to_payload());
        if posted {
            self.inner
                .borrow_mut()
                .first_exception
                .get_or_insert_with(|| error.to_string());
        }
        posted
    }

    /// Stops accepting posts; the terminal status can still be sent
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == ChannelState::Open {
            inner.state = ChannelState::Closed;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().state == ChannelState::Open
    }

    pub fn exception_posted(&self) -> bool {
        self.inner.borrow().first_exception.is_some()
    }

    /// `Name: message` of the first exception posted, if any
    pub fn first_exception(&self) -> Option<String> {
        self.inner.borrow().first_exception.clone()
    }

    /// Sends the terminal status and seals the channel
    ///
    /// Returns false if a terminal status was already sent.
    pub fn finish(&self, report: StatusReport) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.state == ChannelState::Sealed {
            return false;
        }
        inner.emit(MessageType::Status, report.to_payload());
        inner.state = ChannelState::Sealed;
        true
    }
}

/// Sink that keeps messages in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    messages: Rc<RefCell<Vec<Message>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    /// Types of the collected messages, in order
    pub fn types(&self) -> Vec<MessageType> {
        self.messages
            .borrow()
            .iter()
            .map(|m| m.message_type)
            .collect()
    }
}

impl MessageSink for MemorySink {
    fn write(&mut self, message: &Message) {
        self.messages.borrow_mut().push(message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::domain::job::JobStatus;
    use serde_json::json;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let sink = MemorySink::new();
        let channel = Channel::new("job", sink.clone());

        channel.post(MessageType::Log, json!("a"));
        channel.post(MessageType::Warn, json!("b"));
        channel.finish(StatusReport::completed());

        let ids: Vec<u64> = sink.messages().iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_closed_channel_drops_posts_but_accepts_status() {
        let sink = MemorySink::new();
        let channel = Channel::new("job", sink.clone());

        channel.post(MessageType::Complete, json!("bye"));
        channel.close();
        assert!(!channel.post(MessageType::Log, json!("late")));
        assert!(channel.finish(StatusReport::completed()));

        assert_eq!(
            sink.types(),
            vec![MessageType::Complete, MessageType::Status]
        );
    }

    #[test]
    fn test_status_is_sent_once() {
        let sink = MemorySink::new();
        let channel = Channel::new("job", sink.clone());

        assert!(channel.finish(StatusReport::timeout()));
        assert!(!channel.finish(StatusReport::completed()));
        assert!(!channel.post(MessageType::Log, json!("after")));

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].status_report().map(|r| r.status),
            Some(JobStatus::Timeout)
        );
    }

    #[test]
    fn test_exception_flag() {
        let channel = Channel::new("job", MemorySink::new());
        assert!(!channel.exception_posted());

        channel.post_exception(&SerializedError::new("Error", "boom"));
        channel.post_exception(&SerializedError::new("TypeError", "second"));
        assert!(channel.exception_posted());
        assert_eq!(channel.first_exception().as_deref(), Some("Error: boom"));
    }
}
