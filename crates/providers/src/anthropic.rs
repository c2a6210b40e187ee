//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly over SSE.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Extended thinking, with signatures echoed back on later turns

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use turnloop_core::error::{ProviderError, StreamError};
use turnloop_core::message::{ContentBlock, Message, StopReason, Usage};
use turnloop_core::provider::{Provider, Request, ToolDefinition};
use turnloop_core::stream::{Event, EventStream, Stream};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
/// Longest SSE line accepted before the stream is treated as broken.
const MAX_SSE_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
    /// Budget tokens for extended thinking; `None` disables it.
    thinking_budget: Option<u32>,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        // No overall timeout: a streamed turn may legitimately run for minutes
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            default_model: DEFAULT_MODEL.into(),
            client,
            thinking_budget: None,
        })
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Model used when a request carries no override.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Enable extended thinking.
    pub fn with_extended_thinking(mut self, budget_tokens: u32) -> Self {
        self.thinking_budget = Some(budget_tokens);
        self
    }

    /// Convert the transcript to Anthropic messages.
    ///
    /// Tool results travel as `user` messages, and consecutive messages with
    /// the same role are merged because the API requires alternation. Tool
    /// calls from turns that did not stop for tool use were never answered,
    /// so they are left out.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        let mut result: Vec<ApiMessage> = Vec::new();

        for msg in messages {
            let (role, blocks) = match msg {
                Message::User(user) => ("user", user_blocks(&user.content)),
                Message::Assistant(assistant) => {
                    let keep_tool_calls = assistant.stop_reason == StopReason::ToolUse;
                    let blocks = assistant
                        .content
                        .iter()
                        .filter_map(|block| assistant_block(block, keep_tool_calls))
                        .collect();
                    ("assistant", blocks)
                }
                Message::ToolResult(tool) => (
                    "user",
                    vec![ApiBlock::ToolResult {
                        tool_use_id: tool.tool_call_id.clone(),
                        content: user_blocks(&tool.content),
                        is_error: tool.is_error,
                    }],
                ),
            };

            if blocks.is_empty() {
                continue;
            }

            match result.last_mut() {
                Some(previous) if previous.role == role => previous.content.extend(blocks),
                _ => result.push(ApiMessage {
                    role,
                    content: blocks,
                }),
            }
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiTool> {
        tools
            .iter()
            .map(|t| ApiTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn request_body(&self, request: &Request) -> serde_json::Value {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let mut body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(&request.messages),
            "max_tokens": max_tokens,
            "stream": true,
        });

        if !request.system_prompt.is_empty() {
            body["system"] = serde_json::json!(request.system_prompt);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        if let Some(budget) = self.thinking_budget {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": budget
            });
        }

        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<Box<dyn Stream>, ProviderError> {
        request.validate()?;
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "Anthropic API key is not set".into(),
            ));
        }

        let url = format!("{}/v1/messages", self.base_url);
        let body = self.request_body(&request);
        let model = body["model"].as_str().unwrap_or_default().to_string();

        debug!(provider = "anthropic", model = %model, messages = request.messages.len(), "Sending streaming request");

        let send = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = send => response.map_err(|e| ProviderError::Network(e.to_string()))?,
        };

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let events = sse_events(response.bytes_stream());
        Ok(Box::new(EventStream::new(events, cancel).with_model(model)))
    }
}

/// Map Anthropic's stop vocabulary. Anything unrecognized stays `Unknown`.
pub fn map_stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" | "stop_sequence" => StopReason::EndTurn,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Unknown,
    }
}

fn user_blocks(content: &[ContentBlock]) -> Vec<ApiBlock> {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => {
                Some(ApiBlock::Text { text: text.clone() })
            }
            ContentBlock::Image { data, mime_type } => Some(ApiBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: mime_type.clone(),
                    data: STANDARD.encode(data),
                },
            }),
            _ => None,
        })
        .collect()
}

fn assistant_block(block: &ContentBlock, keep_tool_calls: bool) -> Option<ApiBlock> {
    match block {
        ContentBlock::Text { text } if !text.is_empty() => {
            Some(ApiBlock::Text { text: text.clone() })
        }
        // The API only accepts thinking it signed
        ContentBlock::Thinking {
            thinking,
            signature,
        } if !signature.is_empty() => Some(ApiBlock::Thinking {
            thinking: thinking.clone(),
            signature: String::from_utf8_lossy(signature).into_owned(),
        }),
        ContentBlock::ToolCall {
            id,
            name,
            arguments,
            ..
        } if keep_tool_calls => {
            let input = if arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}))
            };
            Some(ApiBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input,
            })
        }
        _ => None,
    }
}

/// Turn a raw SSE byte stream into stream events.
fn sse_events<S, B, E>(
    body: S,
) -> impl futures::Stream<Item = Result<Event, StreamError>> + Send + 'static
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(
        (body.boxed(), SseTranslator::new()),
        |(mut body, mut translator)| async move {
            loop {
                if let Some(item) = translator.pop() {
                    return Some((item, (body, translator)));
                }
                if translator.is_finished() {
                    return None;
                }
                match body.next().await {
                    Some(Ok(bytes)) => translator.feed(bytes.as_ref()),
                    Some(Err(e)) => {
                        translator.finish();
                        return Some((
                            Err(StreamError::Transport(e.to_string())),
                            (body, translator),
                        ));
                    }
                    None => translator.end_of_input(),
                }
            }
        },
    )
}

/// Incremental SSE parser for the Messages API.
///
/// Bytes are buffered until a full line is available, so UTF-8 sequences
/// split across network chunks decode correctly. A line longer than
/// `max_line` fails the stream instead of growing the buffer.
#[derive(Debug)]
struct SseTranslator {
    buffer: Vec<u8>,
    pending: VecDeque<Result<Event, StreamError>>,
    finished: bool,
    max_line: usize,
}

impl SseTranslator {
    fn new() -> Self {
        Self::with_max_line(MAX_SSE_LINE_BYTES)
    }

    fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
            max_line,
        }
    }

    fn pop(&mut self) -> Option<Result<Event, StreamError>> {
        self.pending.pop_front()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }

    fn feed(&mut self, bytes: &[u8]) {
        if self.finished {
            return;
        }
        self.buffer.extend_from_slice(bytes);
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            self.line(&String::from_utf8_lossy(&line));
            if self.finished {
                return;
            }
        }
        if self.buffer.len() > self.max_line {
            warn!(buffered = self.buffer.len(), "SSE line exceeds limit");
            self.pending.push_back(Err(StreamError::Protocol(format!(
                "SSE line longer than {} bytes",
                self.max_line
            ))));
            self.finish();
        }
    }

    fn end_of_input(&mut self) {
        if !self.buffer.is_empty() && !self.finished {
            let rest = std::mem::take(&mut self.buffer);
            self.line(&String::from_utf8_lossy(&rest));
        }
        self.finished = true;
    }

    fn line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        // The event name is repeated in the payload's `type`
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() {
            return;
        }

        let payload: SsePayload = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
                return;
            }
        };
        self.payload(payload);
    }

    fn payload(&mut self, payload: SsePayload) {
        match payload {
            SsePayload::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.emit(Event::Usage(usage.into()));
                }
            }
            SsePayload::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StartBlock::Text { text } => self.emit(Event::text(index, text)),
                StartBlock::Thinking { thinking } => self.emit(Event::thinking(index, thinking)),
                StartBlock::ToolUse { id, name } => {
                    self.emit(Event::tool_call_start(index, id, name))
                }
                StartBlock::Other => trace!(index, "Skipping unsupported content block"),
            },
            SsePayload::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => self.emit(Event::text(index, text)),
                BlockDelta::ThinkingDelta { thinking } => {
                    self.emit(Event::thinking(index, thinking))
                }
                BlockDelta::SignatureDelta { signature } => self.emit(Event::ThinkingDelta {
                    index,
                    thinking: String::new(),
                    signature: signature.into_bytes(),
                }),
                BlockDelta::InputJsonDelta { partial_json } => {
                    self.emit(Event::tool_call_arguments(index, partial_json))
                }
                BlockDelta::Other => trace!(index, "Skipping unsupported delta"),
            },
            SsePayload::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.emit(Event::Usage(usage.into()));
                }
                if let Some(raw) = delta.stop_reason {
                    self.emit(Event::stop(map_stop_reason(&raw), raw));
                }
            }
            SsePayload::MessageStop => self.finished = true,
            SsePayload::Error { error } => {
                self.pending.push_back(Err(StreamError::Transport(format!(
                    "{}: {}",
                    error.kind, error.message
                ))));
                self.finish();
            }
            SsePayload::ContentBlockStop | SsePayload::Ping | SsePayload::Other => {}
        }
    }

    fn emit(&mut self, event: Event) {
        self.pending.push_back(Ok(event));
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ApiBlock>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SsePayload {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<ApiUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl From<ApiUsage> for Usage {
    fn from(usage: ApiUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_write_tokens: usage.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}
