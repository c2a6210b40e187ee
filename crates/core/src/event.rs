//! Loop events and the sinks that receive them.
//!
//! The agent loop reports progress through an [`EventSink`]: every stream
//! [`Event`] is passed through as [`AgentEvent::Delta`], bracketed by turn and
//! tool lifecycle events. Sink failures never affect the run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::message::{StopReason, Usage};
use crate::stream::Event;

/// Events emitted by the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A raw stream event from the current turn.
    Delta(Event),

    /// A model turn is about to be requested (1-based).
    TurnStarted { turn: u32 },

    /// A tool call is being dispatched.
    ToolStarted {
        tool_call_id: String,
        name: String,
        arguments: String,
    },

    /// A tool call returned a result.
    ToolFinished {
        tool_call_id: String,
        name: String,
        is_error: bool,
        duration_ms: u64,
    },

    /// A model turn was appended to the session.
    TurnFinished {
        turn: u32,
        stop_reason: StopReason,
        usage: Usage,
    },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Delta(_) => "delta",
            Self::TurnStarted { .. } => "turn_started",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolFinished { .. } => "tool_finished",
            Self::TurnFinished { .. } => "turn_finished",
        }
    }
}

/// Receives loop events. Errors are logged by the loop and otherwise ignored.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &AgentEvent) -> anyhow::Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &AgentEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag rather than blocking the loop.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &AgentEvent) -> anyhow::Result<()> {
        self.publish(event.clone());
        Ok(())
    }
}
