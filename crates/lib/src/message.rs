//! Provider-neutral message model: conversation turns and their content blocks.
//!
//! A turn's content is either a plain string or an ordered block sequence; block
//! order is significant and preserved through every provider conversion. Once a
//! message has been handed to the store it is never mutated in place;
//! corrections are made by appending new messages.

use serde::{Deserialize, Serialize};

/// Role of a turn. Tool results are their own role, not nested under assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// One content unit inside a tool result (subset of [`ContentBlock`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

/// One semantically typed unit within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Base64 payload plus mime type (e.g. "image/png").
    Image {
        data: String,
        mime_type: String,
    },
    /// Only valid in assistant messages. `id` correlates to exactly one later
    /// tool_result block.
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// Only valid in tool_result messages. `tool_use_id` references a
    /// tool_use block that appeared earlier in the same conversation.
    ToolResult {
        tool_use_id: String,
        is_error: bool,
        content: Vec<ToolResultContent>,
    },
}

/// Message content: plain string or ordered block sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Content as a block slice-equivalent; a plain string is one text block.
    pub fn as_blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(s) => vec![ContentBlock::Text { text: s.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Equality is on the normalized block form: a plain string equals a single
/// text block with the same text. Provider round trips rely on this.
impl PartialEq for MessageContent {
    fn eq(&self, other: &Self) -> bool {
        self.as_blocks() == other.as_blocks()
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
}

/// New opaque message id. Assigned at creation, never reused.
pub fn new_message_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4())
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Tool result turn: one tool_result block per answered tool_use, in the
    /// order the tool_use blocks appeared.
    pub fn tool_result(blocks: Vec<ContentBlock>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::ToolResult,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// The tool_use blocks of this turn (id, name, args), in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, args } => {
                        Some((id.as_str(), name.as_str(), args))
                    }
                    _ => None,
                })
                .collect(),
        }
    }

    /// Concatenated text content of the turn.
    pub fn text(&self) -> String {
        self.content.text()
    }
}
