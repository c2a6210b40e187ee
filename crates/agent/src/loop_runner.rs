//! The agent loop implementation.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use turnloop_core::error::{Error, ProviderError, Result, StreamError, ToolError, ValidationError};
use turnloop_core::event::{AgentEvent, EventSink, NullSink};
use turnloop_core::message::{AssistantMessage, Message, StopReason, ToolCall};
use turnloop_core::provider::{Provider, Request, ToolDefinition};
use turnloop_core::session::Session;
use turnloop_core::tool::{ToolExecutor, ToolResult};

/// Default cap on model turns per invocation.
pub const DEFAULT_MAX_TURNS: u32 = 25;

/// Per-invocation knobs passed through to every [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOptions {
    /// Model override; `None` leaves the choice to the provider
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Model turns allowed before giving up with [`Error::TurnLimit`]
    pub max_turns: u32,
    /// Run sibling tool calls concurrently
    pub parallel_tools: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: None,
            temperature: None,
            max_turns: DEFAULT_MAX_TURNS,
            parallel_tools: true,
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Stop reason of the last assistant turn, or `Aborted` if the caller
    /// cancelled between turns
    pub stop_reason: StopReason,
    /// Model turns requested
    pub turns: u32,
    /// Tool calls executed
    pub tool_calls: usize,
}

/// Drives model turns and tool execution against a [`Session`].
///
/// 1. Validate the session and tool definitions
/// 2. Stream one assistant turn, forwarding every event to the sink
/// 3. Append the assembled message, whatever state the stream ended in
/// 4. On `ToolUse`, run every requested tool, append the results in call
///    order and go back to 2; on any other stop reason, return it
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    executor: Arc<dyn ToolExecutor>,
    tools: Vec<ToolDefinition>,
    options: LoopOptions,
    sink: Arc<dyn EventSink>,
}

impl AgentLoop {
    /// Create a new agent loop.
    pub fn new(
        provider: Arc<dyn Provider>,
        executor: Arc<dyn ToolExecutor>,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            provider,
            executor,
            tools,
            options: LoopOptions::default(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the model override.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    /// Set the maximum number of model turns.
    pub fn with_max_turns(mut self, max: u32) -> Self {
        self.options.max_turns = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    /// Set the default max tokens per model turn.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.options.max_tokens = Some(max);
        self
    }

    pub fn with_parallel_tools(mut self, enabled: bool) -> Self {
        self.options.parallel_tools = enabled;
        self
    }

    /// Attach an event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn options(&self) -> &LoopOptions {
        &self.options
    }

    /// Run turns until the model stops asking for tools.
    ///
    /// Validation problems and broken tool executors come back as `Err`.
    /// Transport failures and cancellation are recorded in the transcript
    /// and reported through [`LoopOutcome::stop_reason`].
    pub async fn run(
        &self,
        session: &mut Session,
        cancel: CancellationToken,
    ) -> Result<LoopOutcome> {
        session.validate_ready()?;
        validate_tools(&self.tools)?;

        info!(
            session_id = %session.id(),
            provider = self.provider.name(),
            messages = session.len(),
            tools = self.tools.len(),
            "Running agent loop"
        );

        let mut turns = 0u32;
        let mut tool_calls = 0usize;

        loop {
            if cancel.is_cancelled() {
                info!(session_id = %session.id(), turns, "Cancelled before the next turn");
                return Ok(LoopOutcome {
                    stop_reason: StopReason::Aborted,
                    turns,
                    tool_calls,
                });
            }

            let request = self.build_request(session);
            request.validate()?;

            turns += 1;
            self.emit(AgentEvent::TurnStarted { turn: turns });

            let message = match self
                .stream_turn(request, &cancel)
                .instrument(debug_span!("turn", session_id = %session.id(), turn = turns))
                .await
            {
                Ok(message) => message,
                // Cancelled while the stream was being opened: nothing to record
                Err(Error::Provider(ProviderError::Cancelled)) => {
                    info!(session_id = %session.id(), turns, "Cancelled while opening a turn");
                    return Ok(LoopOutcome {
                        stop_reason: StopReason::Aborted,
                        turns,
                        tool_calls,
                    });
                }
                Err(e) => return Err(e),
            };

            let stop_reason = message.stop_reason;
            let usage = message.usage;
            let calls = message.tool_calls();
            session.append(message);

            debug!(
                turn = turns,
                stop_reason = %stop_reason,
                tool_calls = calls.len(),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Turn finished"
            );
            self.emit(AgentEvent::TurnFinished {
                turn: turns,
                stop_reason,
                usage,
            });

            if !stop_reason.wants_tool_results() {
                info!(session_id = %session.id(), turns, stop_reason = %stop_reason, "Agent loop finished");
                return Ok(LoopOutcome {
                    stop_reason,
                    turns,
                    tool_calls,
                });
            }

            if calls.is_empty() {
                warn!(turn = turns, "Model stopped for tool use without calling a tool");
                return Ok(LoopOutcome {
                    stop_reason,
                    turns,
                    tool_calls,
                });
            }

            let calls = first_call_per_id(calls);
            let results = self.run_tools(&calls, &cancel).await?;
            tool_calls += calls.len();

            for (call, result) in calls.iter().zip(results) {
                session.append(Message::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    result.content,
                    result.is_error,
                ));
            }

            if !cancel.is_cancelled() && turns >= self.options.max_turns {
                warn!(
                    session_id = %session.id(),
                    max_turns = self.options.max_turns,
                    "Turn limit reached while the model still requested tools"
                );
                return Err(Error::TurnLimit(self.options.max_turns));
            }
        }
    }

    fn build_request(&self, session: &Session) -> Request {
        Request {
            model: self.options.model.clone(),
            system_prompt: session.system_prompt().to_string(),
            messages: session.messages().to_vec(),
            tools: self.tools.clone(),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
        }
    }

    /// Open a stream, pump it to the end (or until cancelled) and assemble
    /// the message.
    async fn stream_turn(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<AssistantMessage> {
        let mut stream = self.provider.stream(cancel.clone(), request).await?;

        let mut events = 0usize;
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(events, "Cancellation observed mid-stream");
                    break;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    events += 1;
                    self.emit(AgentEvent::Delta(event));
                }
                Some(Err(e)) => {
                    warn!(events, error = %e, "Stream ended with a failure");
                    break;
                }
                None => break,
            }
        }

        stream.close();
        match stream.message() {
            Ok(message) => Ok(message),
            Err(StreamError::NotStarted) => Ok(AssistantMessage::new(Vec::new(), StopReason::Aborted)),
            Err(e) => Err(e.into()),
        }
    }

    /// Execute one batch of tool calls. Results line up with `calls`.
    async fn run_tools(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolResult>> {
        debug!(
            count = calls.len(),
            parallel = self.options.parallel_tools,
            "Executing tool calls"
        );

        let results: std::result::Result<Vec<_>, ToolError> = if self.options.parallel_tools {
            let futures = calls
                .iter()
                .map(|call| self.run_tool(call, cancel.child_token()));
            join_all(futures).await.into_iter().collect()
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                if cancel.is_cancelled() {
                    results.push(ToolResult::error(format!(
                        "Tool call {} was cancelled before it started",
                        call.id
                    )));
                    continue;
                }
                results.push(self.run_tool(call, cancel.child_token()).await?);
            }
            Ok(results)
        };

        Ok(results?)
    }

    async fn run_tool(
        &self,
        call: &ToolCall,
        cancel: CancellationToken,
    ) -> std::result::Result<ToolResult, ToolError> {
        self.emit(AgentEvent::ToolStarted {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let span = debug_span!("tool", tool = %call.name, tool_call_id = %call.id);
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.executor.execute(cancel, &call.name, &call.arguments))
            .catch_unwind()
            .instrument(span)
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(tool = %call.name, tool_call_id = %call.id, error = %e, "Tool executor failed");
                return Err(e);
            }
            Err(_) => {
                warn!(tool = %call.name, tool_call_id = %call.id, "Tool executor panicked");
                return Err(ToolError::Panicked {
                    tool_name: call.name.clone(),
                });
            }
        };

        debug!(
            tool = %call.name,
            tool_call_id = %call.id,
            is_error = result.is_error,
            duration_ms,
            "Tool finished"
        );
        self.emit(AgentEvent::ToolFinished {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            is_error: result.is_error,
            duration_ms,
        });

        Ok(result)
    }

    fn emit(&self, event: AgentEvent) {
        if let Err(e) = self.sink.emit(&event) {
            warn!(event = event.event_type(), error = %e, "Event sink failed; continuing");
        }
    }
}

/// Keep the first call for each id. A repeated id within one turn is not
/// executed and gets no result of its own, so every id is answered once.
fn first_call_per_id(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter(|call| {
            let first = seen.insert(call.id.clone());
            if !first {
                warn!(tool = %call.name, tool_call_id = %call.id, "Skipping repeated tool call id");
            }
            first
        })
        .collect()
}

/// Tool names must be non-empty and unique.
pub fn validate_tools(tools: &[ToolDefinition]) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for tool in tools {
        if tool.name.is_empty() {
            return Err(ValidationError::EmptyToolName);
        }
        if !seen.insert(tool.name.as_str()) {
            return Err(ValidationError::DuplicateTool(tool.name.clone()));
        }
    }
    Ok(())
}
