//! The serialized error envelope persisted on failed runs and step attempts,
//! plus the error taxonomy at each module boundary.

use serde::{Deserialize, Serialize};

/// `{name?, message, stack?}`, the shape every `error` JSON column stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializedError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Serialize an `anyhow::Error` the way the engine serializes exceptions
    /// thrown by step bodies and workflow functions: `message` is the
    /// error's `Display`, `stack` is the `{:#}` chain when it has a source.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().map(|c| c.to_string()).collect();
        let stack = if chain.len() > 1 {
            Some(chain.join("\ncaused by: "))
        } else {
            None
        };
        Self {
            name: None,
            message: err.to_string(),
            stack,
        }
    }

    /// Serialize an arbitrary thrown value that isn't an error object, e.g.
    /// a bare number or string propagated out of a step body.
    pub fn from_display(value: impl std::fmt::Display) -> Self {
        Self::new(value.to_string())
    }

    pub fn deadline_exceeded() -> Self {
        Self::new("Workflow run deadline exceeded")
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Sentinel error kinds shared across the port boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("guard mismatch: the expected precondition for this write no longer holds")]
    GuardMismatch,

    #[error("not found")]
    NotFound,

    #[error("cannot cancel a run that has already reached a terminal state")]
    AlreadyTerminal,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip_for_plain_message() {
        let err = SerializedError::from_display(42);
        assert_eq!(err.message, "42");
    }

    #[test]
    fn anyhow_roundtrip_message() {
        let err = anyhow::anyhow!("x");
        let serialized = SerializedError::from_anyhow(&err);
        assert_eq!(serialized.message, "x");
    }

    #[test]
    fn json_shape_omits_absent_fields() {
        let err = SerializedError::new("boom");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value, serde_json::json!({"message": "boom"}));
    }
}
