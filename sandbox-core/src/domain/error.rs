//! Serialized error domain type

use serde::{Deserialize, Serialize};
use std::fmt;

/// A thrown value or rejection reason, flattened for the message channel
///
/// Values that are not errors carry only a message (their string form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
            stack: None,
        }
    }

    /// Wraps the string form of a value that is not an error
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "message": self.message }))
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for SerializedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SerializedError::new("Error", "boom").to_string(), "Error: boom");
        assert_eq!(SerializedError::from_message("42").to_string(), "42");
    }

    #[test]
    fn test_plain_values_omit_name_and_stack() {
        let payload = SerializedError::from_message("oops").to_payload();
        assert_eq!(payload, serde_json::json!({ "message": "oops" }));
    }

    #[test]
    fn test_payload_with_stack() {
        let error = SerializedError::new("TypeError", "x is not a function")
            .with_stack("Uncaught TypeError: x is not a function\n    at <anonymous>");
        let payload = error.to_payload();
        assert_eq!(payload["name"], "TypeError");
        assert!(payload["stack"].as_str().unwrap().starts_with("Uncaught"));
    }
}
