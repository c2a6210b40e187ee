//! Pull-based streaming: the [`Event`] union, the [`Stream`] contract, and the
//! shared machinery providers build their streams from.
//!
//! A stream is driven by its caller one `next()` at a time, so a slow consumer
//! never causes unbounded buffering and cancellation is simply "stop pulling
//! and call `close()`". [`StreamAccumulator`] owns the state table every
//! implementation must honor; [`EventStream`] wraps any `futures::Stream` of
//! events in that state machine and watches a [`CancellationToken`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::base64_bytes;
use crate::error::StreamError;
use crate::message::{AssistantMessage, ContentBlock, StopReason, Usage};

/// Where a stream is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Nothing pulled yet
    New,
    /// Deltas received, no terminal condition yet
    Streaming,
    /// Reached a natural end
    Complete,
    /// A failure (including cancellation) ended the stream
    Error,
    /// Released by the caller before a terminal state
    Closed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// One increment of a streamed assistant turn.
///
/// Deltas carry the stable index of the content block they extend, so a
/// backend may grow several blocks at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TextDelta {
        index: usize,
        text: String,
    },

    ThinkingDelta {
        index: usize,
        thinking: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        signature: Vec<u8>,
    },

    /// `id` and `name` are normally sent once, on the first delta for the
    /// block; empty strings leave the accumulated values alone.
    ToolCallDelta {
        index: usize,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        name: String,
        arguments: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        signature: Vec<u8>,
    },

    Usage(Usage),

    Stop {
        reason: StopReason,
        raw: String,
    },
}

impl Event {
    pub fn text(index: usize, text: impl Into<String>) -> Self {
        Self::TextDelta {
            index,
            text: text.into(),
        }
    }

    pub fn thinking(index: usize, thinking: impl Into<String>) -> Self {
        Self::ThinkingDelta {
            index,
            thinking: thinking.into(),
            signature: Vec::new(),
        }
    }

    /// First delta of a tool call: introduces its id and name.
    pub fn tool_call_start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ToolCallDelta {
            index,
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
            signature: Vec::new(),
        }
    }

    pub fn tool_call_arguments(index: usize, arguments: impl Into<String>) -> Self {
        Self::ToolCallDelta {
            index,
            id: String::new(),
            name: String::new(),
            arguments: arguments.into(),
            signature: Vec::new(),
        }
    }

    pub fn stop(reason: StopReason, raw: impl Into<String>) -> Self {
        Self::Stop {
            reason,
            raw: raw.into(),
        }
    }

    /// The content block this event extends, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::TextDelta { index, .. }
            | Self::ThinkingDelta { index, .. }
            | Self::ToolCallDelta { index, .. } => Some(*index),
            Self::Usage(_) | Self::Stop { .. } => None,
        }
    }
}

/// The contract every backend stream satisfies.
///
/// `message()` is exact per state:
///
/// | state | `message()` |
/// |---|---|
/// | `New` | `Err(StreamError::NotStarted)` |
/// | `Streaming` | partial message |
/// | `Complete` | full message |
/// | `Error` | partial message, stop reason `Error` (or `Aborted` if cancelled) |
/// | `Closed` | partial message, stop reason `Aborted` |
///
/// Closing after a terminal state keeps that state and its result.
#[async_trait]
pub trait Stream: Send {
    /// Pull the next event.
    ///
    /// `None` means the stream has reached a terminal state and will never
    /// produce anything again. After a premature `close()` this returns
    /// `Some(Err(StreamError::Closed))`.
    async fn next(&mut self) -> Option<Result<Event, StreamError>>;

    fn state(&self) -> StreamState;

    /// Assemble everything received so far.
    fn message(&self) -> Result<AssistantMessage, StreamError>;

    /// Release underlying resources. Safe to call on every exit path and more
    /// than once.
    fn close(&mut self);
}

#[derive(Debug, Clone)]
enum PartialBlock {
    Text(String),
    Thinking {
        thinking: String,
        signature: Vec<u8>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
        signature: Vec<u8>,
    },
}

impl PartialBlock {
    fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
        }
    }

    fn to_content(&self) -> ContentBlock {
        match self {
            Self::Text(text) => ContentBlock::Text { text: text.clone() },
            Self::Thinking {
                thinking,
                signature,
            } => ContentBlock::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            },
            Self::ToolCall {
                id,
                name,
                arguments,
                signature,
            } => ContentBlock::ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
                signature: signature.clone(),
            },
        }
    }
}

/// The state machine behind every [`Stream`].
///
/// Providers that do not use [`EventStream`] can still embed this to get the
/// `message()` table right.
#[derive(Debug, Clone)]
pub struct StreamAccumulator {
    state: StreamState,
    /// Blocks in order of first introduction
    blocks: Vec<PartialBlock>,
    /// Delta index → position in `blocks`
    positions: HashMap<usize, usize>,
    usage: Usage,
    stop: Option<(StopReason, String)>,
    failure: Option<StreamError>,
    model: Option<String>,
    timestamp: DateTime<Utc>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            state: StreamState::New,
            blocks: Vec::new(),
            positions: HashMap::new(),
            usage: Usage::default(),
            stop: None,
            failure: None,
            model: None,
            timestamp: Utc::now(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The failure that ended the stream, when it ended in `Error`.
    pub fn failure(&self) -> Option<&StreamError> {
        self.failure.as_ref()
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }

    /// Fold one event in. A block-kind conflict is a protocol error; the
    /// accumulator is left unchanged and the caller is expected to `fail()`.
    pub fn apply(&mut self, event: &Event) -> Result<(), StreamError> {
        match self.state {
            StreamState::New => self.state = StreamState::Streaming,
            StreamState::Streaming => {}
            StreamState::Complete | StreamState::Error | StreamState::Closed => {
                return Err(StreamError::Protocol(format!(
                    "event received in {:?} state",
                    self.state
                )));
            }
        }

        match event {
            Event::TextDelta { index, text } => {
                match self.block_at(*index, || PartialBlock::Text(String::new()))? {
                    PartialBlock::Text(existing) => existing.push_str(text),
                    other => return Err(kind_conflict(*index, other.kind(), "text")),
                }
            }
            Event::ThinkingDelta {
                index,
                thinking,
                signature,
            } => {
                let fresh = || PartialBlock::Thinking {
                    thinking: String::new(),
                    signature: Vec::new(),
                };
                match self.block_at(*index, fresh)? {
                    PartialBlock::Thinking {
                        thinking: existing,
                        signature: existing_signature,
                    } => {
                        existing.push_str(thinking);
                        existing_signature.extend_from_slice(signature);
                    }
                    other => return Err(kind_conflict(*index, other.kind(), "thinking")),
                }
            }
            Event::ToolCallDelta {
                index,
                id,
                name,
                arguments,
                signature,
            } => {
                let fresh = || PartialBlock::ToolCall {
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                    signature: Vec::new(),
                };
                match self.block_at(*index, fresh)? {
                    PartialBlock::ToolCall {
                        id: existing_id,
                        name: existing_name,
                        arguments: existing_arguments,
                        signature: existing_signature,
                    } => {
                        if existing_id.is_empty() && !id.is_empty() {
                            existing_id.clone_from(id);
                        }
                        if existing_name.is_empty() && !name.is_empty() {
                            existing_name.clone_from(name);
                        }
                        existing_arguments.push_str(arguments);
                        existing_signature.extend_from_slice(signature);
                    }
                    other => return Err(kind_conflict(*index, other.kind(), "tool_call")),
                }
            }
            Event::Usage(usage) => self.usage.merge(usage),
            Event::Stop { reason, raw } => {
                trace!(reason = %reason, raw = %raw, "Stop event received");
                self.stop = Some((*reason, raw.clone()));
            }
        }

        Ok(())
    }

    /// The event source ran dry. Completes if a stop reason was seen,
    /// otherwise the stream is failed with a protocol error.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        if self.state.is_terminal() || self.state == StreamState::Closed {
            return Ok(());
        }
        if self.stop.is_some() {
            self.state = StreamState::Complete;
            Ok(())
        } else {
            let error = StreamError::Protocol("stream ended without a stop reason".into());
            self.fail(error.clone());
            Err(error)
        }
    }

    /// Move to `Error`. No effect once terminal or closed.
    pub fn fail(&mut self, error: StreamError) {
        if self.state.is_terminal() || self.state == StreamState::Closed {
            return;
        }
        debug!(error = %error, blocks = self.blocks.len(), "Stream failed");
        self.failure = Some(error);
        self.state = StreamState::Error;
    }

    /// Caller released the stream. Only changes state if no terminal state
    /// was reached first.
    pub fn close(&mut self) {
        if matches!(self.state, StreamState::New | StreamState::Streaming) {
            self.state = StreamState::Closed;
        }
    }

    pub fn message(&self) -> Result<AssistantMessage, StreamError> {
        let stop_reason = match self.state {
            StreamState::New => return Err(StreamError::NotStarted),
            StreamState::Complete => self
                .stop
                .as_ref()
                .map(|(reason, _)| *reason)
                .unwrap_or(StopReason::Unknown),
            StreamState::Error => match &self.failure {
                Some(error) if error.is_cancellation() => StopReason::Aborted,
                _ => StopReason::Error,
            },
            StreamState::Closed => StopReason::Aborted,
            StreamState::Streaming => self
                .stop
                .as_ref()
                .map(|(reason, _)| *reason)
                .unwrap_or(StopReason::Unknown),
        };

        Ok(AssistantMessage {
            content: self.blocks.iter().map(PartialBlock::to_content).collect(),
            stop_reason,
            raw_stop_reason: self
                .stop
                .as_ref()
                .map(|(_, raw)| raw.clone())
                .unwrap_or_default(),
            usage: self.usage,
            model: self.model.clone(),
            timestamp: self.timestamp,
        })
    }

    fn block_at(
        &mut self,
        index: usize,
        fresh: impl FnOnce() -> PartialBlock,
    ) -> Result<&mut PartialBlock, StreamError> {
        let position = match self.positions.get(&index) {
            Some(position) => *position,
            None => {
                self.blocks.push(fresh());
                let position = self.blocks.len() - 1;
                self.positions.insert(index, position);
                position
            }
        };
        self.blocks
            .get_mut(position)
            .ok_or_else(|| StreamError::Protocol(format!("lost block for index {index}")))
    }
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_conflict(index: usize, existing: &str, incoming: &str) -> StreamError {
    StreamError::Protocol(format!(
        "{incoming} delta addressed block {index}, which is a {existing} block"
    ))
}

enum Pulled {
    Cancelled,
    Item(Option<Result<Event, StreamError>>),
}

/// A [`Stream`] over any source of events.
///
/// Providers translate their wire framing into a `futures::Stream` of
/// [`Event`]s and hand it here; cancellation, terminal-state handling and
/// message assembly are shared.
pub struct EventStream {
    source: Option<BoxStream<'static, Result<Event, StreamError>>>,
    cancel: CancellationToken,
    accumulator: StreamAccumulator,
}

impl EventStream {
    pub fn new<S>(source: S, cancel: CancellationToken) -> Self
    where
        S: futures::Stream<Item = Result<Event, StreamError>> + Send + 'static,
    {
        Self {
            source: Some(source.boxed()),
            cancel,
            accumulator: StreamAccumulator::new(),
        }
    }

    /// Record the model id that will appear on the assembled message.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.accumulator.set_model(model);
        self
    }

    fn release(&mut self) {
        self.source = None;
    }

    fn failed(&mut self, error: StreamError) -> Option<Result<Event, StreamError>> {
        self.release();
        self.accumulator.fail(error.clone());
        Some(Err(error))
    }
}

#[async_trait]
impl Stream for EventStream {
    async fn next(&mut self) -> Option<Result<Event, StreamError>> {
        match self.accumulator.state() {
            StreamState::Complete | StreamState::Error => return None,
            StreamState::Closed => return Some(Err(StreamError::Closed)),
            StreamState::New | StreamState::Streaming => {}
        }

        let Some(source) = self.source.as_mut() else {
            return Some(Err(StreamError::Closed));
        };

        let pulled = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Pulled::Cancelled,
            item = source.next() => Pulled::Item(item),
        };

        match pulled {
            Pulled::Cancelled => self.failed(StreamError::Cancelled),
            Pulled::Item(Some(Ok(event))) => match self.accumulator.apply(&event) {
                Ok(()) => Some(Ok(event)),
                Err(error) => self.failed(error),
            },
            Pulled::Item(Some(Err(error))) => self.failed(error),
            Pulled::Item(None) => {
                self.release();
                match self.accumulator.finish() {
                    Ok(()) => None,
                    Err(error) => Some(Err(error)),
                }
            }
        }
    }

    fn state(&self) -> StreamState {
        self.accumulator.state()
    }

    fn message(&self) -> Result<AssistantMessage, StreamError> {
        self.accumulator.message()
    }

    fn close(&mut self) {
        self.release();
        self.accumulator.close();
    }
}
