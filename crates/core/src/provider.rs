//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider knows how to send one turn's [`Request`] to a model and hand
//! back a pull-based [`Stream`] of deltas. Everything vendor specific (wire
//! framing, stop-reason vocabulary, tool-call encoding) stays behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, ValidationError};
use crate::message::Message;
use crate::stream::Stream;

/// Inclusive temperature bounds accepted by [`Request::validate`].
pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);

/// One turn's inputs.
///
/// Requests are handed to providers by value, so a provider can never
/// reach back into the caller's history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Model override; `None` lets the provider use its default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub system_prompt: String,

    /// The full conversation so far
    pub messages: Vec<Message>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Output token cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature, within [`TEMPERATURE_RANGE`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Request {
    /// Range-check the sampling parameters.
    ///
    /// `max_tokens` is unsigned, so only the temperature needs a runtime check.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(temperature) = self.temperature {
            let (low, high) = TEMPERATURE_RANGE;
            if !temperature.is_finite() || temperature < low || temperature > high {
                return Err(ValidationError::TemperatureOutOfRange(temperature));
            }
        }
        Ok(())
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// The core Provider trait.
///
/// Every backend implements this. The agent loop calls `stream()` once per
/// turn without knowing which backend is behind it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic", "scripted").
    fn name(&self) -> &str;

    /// Begin a turn.
    ///
    /// An `Err` means nothing was started and there is no partial state.
    /// Implementations must call [`Request::validate`] before any network
    /// traffic and must honor `cancel` both here and inside the stream.
    async fn stream(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> std::result::Result<Box<dyn Stream>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_are_valid() {
        let req = Request::default();
        assert!(req.validate().is_ok());
        assert!(req.model.is_none());
        assert!(req.max_tokens.is_none());
    }

    #[test]
    fn temperature_bounds_are_inclusive() {
        for temperature in [0.0, 1.0, 2.0] {
            let req = Request {
                temperature: Some(temperature),
                ..Request::default()
            };
            assert!(req.validate().is_ok(), "{temperature} should be accepted");
        }
    }

    #[test]
    fn out_of_range_temperature_rejected() {
        for temperature in [-0.1, 2.01, 3.5, f32::NAN, f32::INFINITY] {
            let req = Request {
                temperature: Some(temperature),
                ..Request::default()
            };
            assert!(
                matches!(
                    req.validate(),
                    Err(ValidationError::TemperatureOutOfRange(_))
                ),
                "{temperature} should be rejected"
            );
        }
    }

    #[test]
    fn tool_definition_serialization() {
        let tool = ToolDefinition {
            name: "shell".into(),
            description: "Execute a shell command".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The command to run" }
                },
                "required": ["command"]
            }),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("shell"));
        assert!(json.contains("command"));
    }
}
