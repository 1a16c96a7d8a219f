//! The "Standard Schema" interop protocol: a trait object third-party
//! validator crates can be adapted to, so the engine never depends on any
//! particular validation library directly.

use async_trait::async_trait;

/// One validation issue. The protocol allows richer shapes (paths, codes);
/// only the message is modeled here since nothing downstream inspects more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .0.iter().map(|i| i.message.as_str()).collect::<Vec<_>>().join("; "))]
pub struct SchemaIssues(pub Vec<SchemaIssue>);

/// An adapter over an arbitrary input-validation library. `validate` accepts
/// an unknown JSON value and returns either the (possibly transformed) value
/// or a non-empty set of issues.
#[async_trait]
pub trait InputSchema: Send + Sync {
    async fn validate(&self, input: serde_json::Value) -> Result<serde_json::Value, SchemaIssues>;
}

/// A schema that accepts anything unchanged; the default when a workflow
/// declares no input schema.
pub struct NoOpSchema;

#[async_trait]
impl InputSchema for NoOpSchema {
    async fn validate(&self, input: serde_json::Value) -> Result<serde_json::Value, SchemaIssues> {
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_schema_passes_input_through() {
        let schema = NoOpSchema;
        let input = serde_json::json!({"name": "Alice"});
        let result = schema.validate(input.clone()).await.unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn issues_join_with_semicolons() {
        let issues = SchemaIssues(vec![
            SchemaIssue { message: "name is required".into() },
            SchemaIssue { message: "age must be positive".into() },
        ]);
        assert_eq!(issues.to_string(), "name is required; age must be positive");
    }
}
