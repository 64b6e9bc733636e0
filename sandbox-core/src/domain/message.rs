//! Message domain types
//!
//! A message is one event on the channel from a worker to the host. Messages
//! are produced by the worker, numbered in order, and never mutated after
//! they are created.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::domain::error::SerializedError;
use crate::domain::job::JobStatus;
use crate::domain::test::TestReport;

/// Error text used when the host kills a worker that ran out of time
pub const TIMEOUT_ERROR: &str = "VM reached max time of execution allowed, timed out.";

/// Payload of the notification posted right before a worker closes itself
pub const CLOSING_NOTICE: &str = "[sandbox] Worker closing...";

/// Error text used when a worker exits without a terminal status
pub const UNEXPECTED_TERMINATION: &str = "worker terminated unexpectedly";

/// Discriminant of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Exception,
    Complete,
    Status,
    Result,
    Test,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Log => "log",
            MessageType::Info => "info",
            MessageType::Warn => "warn",
            MessageType::Error => "error",
            MessageType::Debug => "debug",
            MessageType::Exception => "exception",
            MessageType::Complete => "complete",
            MessageType::Status => "status",
            MessageType::Result => "result",
            MessageType::Test => "test",
        }
    }

    /// Parses the name used as the SSE event name
    pub fn from_name(name: &str) -> Option<Self> {
        let message_type = match name {
            "log" => MessageType::Log,
            "info" => MessageType::Info,
            "warn" => MessageType::Warn,
            "error" => MessageType::Error,
            "debug" => MessageType::Debug,
            "exception" => MessageType::Exception,
            "complete" => MessageType::Complete,
            "status" => MessageType::Status,
            "result" => MessageType::Result,
            "test" => MessageType::Test,
            _ => return None,
        };
        Some(message_type)
    }

    /// True for the console-backed types
    pub fn is_console(&self) -> bool {
        matches!(
            self,
            MessageType::Log
                | MessageType::Info
                | MessageType::Warn
                | MessageType::Error
                | MessageType::Debug
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Info,
    Error,
    Completion,
}

impl MessageKind {
    /// Derives the kind of a message from its type and payload
    ///
    /// `complete` and terminal statuses are completions, `error` and
    /// `exception` are errors, everything else is informational.
    pub fn classify(message_type: MessageType, payload: &JsonValue) -> Self {
        match message_type {
            MessageType::Complete => MessageKind::Completion,
            MessageType::Error | MessageType::Exception => MessageKind::Error,
            MessageType::Status => {
                let terminal = serde_json::from_value::<StatusReport>(payload.clone())
                    .map(|report| report.status.is_terminal())
                    .unwrap_or(false);
                if terminal {
                    MessageKind::Completion
                } else {
                    MessageKind::Info
                }
            }
            _ => MessageKind::Info,
        }
    }
}

/// One event on the message channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub job_id: String,
    pub message_id: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub kind: MessageKind,
    pub payload: JsonValue,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Message {
    /// Creates a message, deriving its kind from type and payload
    pub fn new(
        job_id: impl Into<String>,
        message_id: u64,
        message_type: MessageType,
        payload: JsonValue,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            message_id,
            kind: MessageKind::classify(message_type, &payload),
            message_type,
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Creates a status message
    pub fn status(job_id: impl Into<String>, message_id: u64, report: &StatusReport) -> Self {
        Self::new(job_id, message_id, MessageType::Status, report.to_payload())
    }

    /// Returns the status report if this is a well-formed status message
    pub fn status_report(&self) -> Option<StatusReport> {
        if self.message_type != MessageType::Status {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// True if this message ends its job
    pub fn is_terminal(&self) -> bool {
        self.status_report()
            .map(|report| report.status.is_terminal())
            .unwrap_or(false)
    }

    /// Returns the error if this is an exception message
    pub fn exception(&self) -> Option<SerializedError> {
        if self.message_type != MessageType::Exception {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Returns the test report if this is a test message
    pub fn test_report(&self) -> Option<TestReport> {
        if self.message_type != MessageType::Test {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Returns the text of console and completion messages
    pub fn text(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

/// Payload of a `status` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: JobStatus::Timeout,
            error: Some(TIMEOUT_ERROR.to_string()),
        }
    }

    pub fn to_payload(&self) -> JsonValue {
        let mut payload = serde_json::json!({ "status": self.status });
        if let Some(error) = &self.error {
            payload["error"] = JsonValue::String(error.clone());
        }
        payload
    }
}
