//! Job DTOs for the HTTP API

use serde::{Deserialize, Serialize};

use crate::domain::job::JobStatus;
use crate::domain::message::{Message, MessageType};

/// Request to submit a script
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitJob {
    pub script: String,
    /// Stream events over SSE instead of waiting for the buffered report
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub testing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SubmitJob {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }
}

/// Response to a streaming submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub events_url: String,
}

/// Outcome of a job executed to completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub messages: Vec<Message>,
}

impl ExecutionReport {
    /// Summarizes the full message sequence of a job
    ///
    /// The status comes from the terminal status message; a sequence without
    /// one is reported as failed.
    pub fn from_messages(job_id: impl Into<String>, messages: Vec<Message>) -> Self {
        let terminal = messages
            .iter()
            .rev()
            .find_map(|m| m.status_report().filter(|r| r.status.is_terminal()));

        let (status, error) = match terminal {
            Some(report) => (report.status, report.error),
            None => (
                JobStatus::Failed,
                Some("stream ended without a terminal status".to_string()),
            ),
        };

        let result = messages
            .iter()
            .rev()
            .find(|m| m.message_type == MessageType::Result)
            .map(|m| m.payload.clone());

        Self {
            job_id: job_id.into(),
            status,
            error,
            result,
            messages,
        }
    }

    /// Console lines of the given type, in order
    pub fn lines(&self, message_type: MessageType) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| m.message_type == message_type)
            .filter_map(|m| m.text())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::StatusReport;
    use serde_json::json;

    #[test]
    fn test_report_from_messages() {
        let messages = vec![
            Message::new("j", 1, MessageType::Log, json!("hello")),
            Message::new("j", 2, MessageType::Result, json!({"n": 1})),
            Message::new("j", 3, MessageType::Complete, json!("bye")),
            Message::status("j", 4, &StatusReport::completed()),
        ];

        let report = ExecutionReport::from_messages("j", messages);
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.result, Some(json!({"n": 1})));
        assert_eq!(report.lines(MessageType::Log), vec!["hello"]);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_report_without_terminal_status_is_failed() {
        let messages = vec![Message::new("j", 1, MessageType::Log, json!("partial"))];
        let report = ExecutionReport::from_messages("j", messages);
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.error.is_some());
    }

    #[test]
    fn test_submit_defaults() {
        let req: SubmitJob = serde_json::from_str(r#"{"script":"1"}"#).unwrap();
        assert!(!req.stream);
        assert!(!req.testing);
        assert!(req.timeout_ms.is_none());
    }
}
