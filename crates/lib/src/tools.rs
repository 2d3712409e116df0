//! Tool registry seam consumed by provider adapters.
//!
//! Tool discovery and invocation go through [`ToolRegistry`]; the transport
//! behind it (MCP process lifecycle, handshake) is a collaborator outside this
//! crate. Protocol-level tool failures come back as data (`is_error` on the
//! outcome), never as an `Err`; only an unreachable tool channel errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::ToolResultContent;

/// A discoverable tool: name, description, JSON-Schema-like input shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One content unit of a tool outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl From<ToolContent> for ToolResultContent {
    fn from(c: ToolContent) -> Self {
        match c {
            ToolContent::Text { text } => ToolResultContent::Text { text },
            ToolContent::Image { data, mime_type } => {
                ToolResultContent::Image { data, mime_type }
            }
        }
    }
}

/// Outcome of one tool invocation. Errors are encoded, not thrown, so they
/// can flow back into the model as conversation content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub is_error: bool,
    pub content: Vec<ToolContent>,
}

impl ToolOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            is_error: false,
            content: vec![ToolContent::Text { text: text.into() }],
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: vec![ToolContent::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool process/channel itself is unreachable.
    #[error("tool transport failed: {0}")]
    Transport(String),
}

/// Discovers and executes tools. Implemented over the MCP transport in the
/// application shell; mocked in tests.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;
    /// Execute a named tool. Resolves with `is_error = true` for tool-level
    /// failures; `Err` only when the transport is down.
    async fn call_tool(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<ToolOutcome, ToolError>;
}

/// Registry with no tools: discovery is empty, any call resolves to an error
/// outcome. Used for tool-less chat runs.
pub struct NoTools;

#[async_trait]
impl ToolRegistry for NoTools {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        Ok(Vec::new())
    }

    async fn call_tool(
        &self,
        name: &str,
        _args: &serde_json::Value,
    ) -> Result<ToolOutcome, ToolError> {
        Ok(ToolOutcome::error(format!("unknown tool: {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_tools_resolves_unknown_calls_as_error_outcome() {
        let registry = NoTools;
        assert!(registry.list_tools().await.unwrap().is_empty());
        let outcome = registry
            .call_tool("calc", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(outcome.is_error);
        assert!(matches!(
            &outcome.content[0],
            ToolContent::Text { text } if text.contains("calc")
        ));
    }
}
