//! Host/worker wire protocol
//!
//! The host writes a single JSON [`WorkerRequest`] to the worker's stdin and
//! closes it. The worker answers with newline-delimited JSON [`Message`]s on
//! stdout, one message per line, in order. Stderr is reserved for the
//! worker's own diagnostics and is never parsed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::env::EnvSnapshot;
use crate::domain::message::Message;

/// Everything a worker needs to run one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job_id: String,
    pub script: String,
    #[serde(default)]
    pub env: EnvSnapshot,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub testing: bool,
    /// Whether `fetch` may reach the network
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Engine limits applied inside the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 1024 * 1024,
        }
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty protocol line")]
    Empty,

    #[error("malformed protocol payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encodes a message as one line, including the trailing newline
pub fn encode_message(message: &Message) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line of worker output
pub fn decode_message(line: &str) -> Result<Message, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}

pub fn encode_request(request: &WorkerRequest) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_request(input: &str) -> Result<WorkerRequest, ProtocolError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{MessageKind, MessageType};

    #[test]
    fn test_encoded_message_is_single_line() {
        let message = Message::new("job", 1, MessageType::Log, serde_json::json!("a\nb"));
        let line = encode_message(&message).unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let decoded = decode_message(&line).unwrap();
        assert_eq!(decoded.payload, "a\nb");
        assert_eq!(decoded.kind, MessageKind::Info);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_message("   "), Err(ProtocolError::Empty)));
        assert!(matches!(
            decode_message("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_message(r#"{"type":"log"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_request_defaults() {
        let request =
            decode_request(r#"{"job_id":"abc","script":"1+1","timeout_ms":500}"#).unwrap();

        assert!(request.env.is_empty());
        assert!(request.input.is_none());
        assert!(!request.testing);
        assert!(!request.allow_network);
        assert_eq!(request.limits, ResourceLimits::default());
    }
}
