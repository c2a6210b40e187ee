//! # turnloop core
//!
//! Domain types, traits, and error definitions for the turnloop agent
//! harness. Nothing in here knows about HTTP, files, or terminals: backends,
//! tools and storage live in their own crates and depend inward on this one.
//!
//! - [`message`]: roles, content blocks, messages, stop reasons, usage
//! - [`provider`] / [`stream`]: the backend contract and the pull-based
//!   stream state machine
//! - [`tool`]: the tool execution contract and a name-dispatching registry
//! - [`session`]: the append-only transcript
//! - [`event`]: loop progress events and sinks

pub mod codec;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod session;
pub mod stream;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, StreamError, ToolError, ValidationError};
pub use event::{AgentEvent, EventBus, EventSink, NullSink};
pub use message::{
    AssistantMessage, ContentBlock, Message, Role, StopReason, ToolCall, ToolResultMessage, Usage,
    UserMessage,
};
pub use provider::{Provider, Request, ToolDefinition};
pub use session::Session;
pub use stream::{Event, EventStream, Stream, StreamAccumulator, StreamState};
pub use tool::{Tool, ToolExecutor, ToolRegistry, ToolResult};
