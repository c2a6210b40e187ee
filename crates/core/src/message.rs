//! Content model: roles, content blocks, messages, stop reasons and usage.
//!
//! These are the value objects that flow through the whole system:
//! the caller appends a user message → the loop streams an assistant message →
//! tools answer with tool-result messages → the session records all of it.
//!
//! The serde representation of these types *is* the persisted wire format:
//! messages carry a `type` discriminator (`user` / `assistant` /
//! `tool_result`), content blocks carry their own (`text` / `thinking` /
//! `image` / `tool_call`), and unknown discriminators fail to deserialize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{base64_bytes, is_zero};

/// The logical speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human driving the conversation
    User,
    /// The model
    Assistant,
    /// Output of a tool the model asked for
    ToolResult,
}

/// One typed unit of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },

    /// Model reasoning. The signature is opaque provider data that must be
    /// echoed back byte-for-byte on later turns.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        signature: Vec<u8>,
    },

    Image {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mime_type: String,
    },

    /// A request from the model to run a tool. `arguments` is the raw
    /// argument text exactly as streamed; an empty signature means none.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        signature: Vec<u8>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data,
            mime_type: mime_type.into(),
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            signature: Vec::new(),
        }
    }

    /// The `type` discriminator used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::Image { .. } => "image",
            Self::ToolCall { .. } => "tool_call",
        }
    }
}

/// A tool invocation extracted from an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument payload (normally a JSON object)
    pub arguments: String,
}

/// Normalized reason a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model finished its answer
    EndTurn,
    /// The output token cap was hit
    Length,
    /// The model wants tool results before continuing
    ToolUse,
    /// Transport or protocol failure
    Error,
    /// Cancelled by the caller
    Aborted,
    /// The provider reported something we do not recognize
    Unknown,
}

impl StopReason {
    /// Whether the loop should keep going after a turn that ended this way.
    pub fn wants_tool_results(self) -> bool {
        matches!(self, Self::ToolUse)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::Length => "length",
            Self::ToolUse => "tool_use",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage for one turn.
///
/// Cache counters are omitted from the wire when zero so that envelopes
/// written before they existed still read back cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_read_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_write_tokens: u64,
}

impl Usage {
    /// Fold a later usage report into this one. Providers report running
    /// totals, so non-zero fields overwrite and zero fields are ignored.
    pub fn merge(&mut self, update: &Usage) {
        if update.input_tokens != 0 {
            self.input_tokens = update.input_tokens;
        }
        if update.output_tokens != 0 {
            self.output_tokens = update.output_tokens;
        }
        if update.cache_read_tokens != 0 {
            self.cache_read_tokens = update.cache_read_tokens;
        }
        if update.cache_write_tokens != 0 {
            self.cache_write_tokens = update.cache_write_tokens;
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
}

impl UserMessage {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,

    pub stop_reason: StopReason,

    /// The provider's untranslated stop string, kept for diagnostics
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_stop_reason: String,

    #[serde(default)]
    pub usage: Usage,

    /// Model id reported by the backend, when it reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    pub fn new(content: Vec<ContentBlock>, stop_reason: StopReason) -> Self {
        Self {
            content,
            stop_reason,
            raw_stop_reason: String::new(),
            usage: Usage::default(),
            model: None,
            timestamp: Utc::now(),
        }
    }

    /// All text blocks concatenated in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool calls in the order the model emitted them.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                    ..
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    /// The tool call this message answers
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// A single entry in a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    /// A user message with a single text block.
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage::new(vec![ContentBlock::text(text)]))
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Vec<ContentBlock>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult(ToolResultMessage {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content,
            is_error,
            timestamp: Utc::now(),
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User(_) => Role::User,
            Self::Assistant(_) => Role::Assistant,
            Self::ToolResult(_) => Role::ToolResult,
        }
    }

    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Self::User(m) => &m.content,
            Self::Assistant(m) => &m.content,
            Self::ToolResult(m) => &m.content,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::User(m) => m.timestamp,
            Self::Assistant(m) => m.timestamp,
            Self::ToolResult(m) => m.timestamp,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            _ => None,
        }
    }
}

impl From<AssistantMessage> for Message {
    fn from(message: AssistantMessage) -> Self {
        Self::Assistant(message)
    }
}

impl From<UserMessage> for Message {
    fn from(message: UserMessage) -> Self {
        Self::User(message)
    }
}

impl From<ToolResultMessage> for Message {
    fn from(message: ToolResultMessage) -> Self {
        Self::ToolResult(message)
    }
}
