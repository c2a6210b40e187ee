//! Error types for turnloop.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] folds them together
//! for callers of the agent loop.

use thiserror::Error;

/// The top-level error type for loop invocations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Rejected before any network call ---
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // --- A turn could not be started ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Stream plumbing outside of a turn's normal termination ---
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    // --- The tool executor itself is broken ---
    #[error("Tool dispatch error: {0}")]
    Tool(#[from] ToolError),

    #[error("Turn limit of {0} reached while the model still requested tools")]
    TurnLimit(u32),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Malformed inputs, caught before a provider is contacted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("temperature must be a finite value between 0 and 2, got {0}")]
    TemperatureOutOfRange(f32),

    #[error("session has no messages")]
    EmptySession,

    #[error("session ends with an assistant message; append a user message first")]
    AwaitingUserInput,

    #[error("tool call '{tool_call_id}' has no tool result")]
    MissingToolResult { tool_call_id: String },

    #[error("tool result '{tool_call_id}' does not answer a call in the preceding assistant message")]
    OrphanToolResult { tool_call_id: String },

    #[error("tool definition has an empty name")]
    EmptyToolName,

    #[error("tool '{0}' is defined more than once")]
    DuplicateTool(String),
}

/// Failures to start a turn.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ValidationError),

    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Cancelled before the stream opened")]
    Cancelled,
}

/// Failures observed while pulling from a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream has not produced anything yet")]
    NotStarted,

    #[error("stream was closed")]
    Closed,

    #[error("stream cancelled")]
    Cancelled,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl StreamError {
    /// Whether this failure was requested by the caller rather than suffered.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Executor-internal failures. Anything a tool can meaningfully report
/// belongs in a `ToolResult` with `is_error` set, never here.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Tool dispatch failed for {tool_name}: {reason}")]
    Dispatch { tool_name: String, reason: String },

    #[error("Tool panicked: {tool_name}")]
    Panicked { tool_name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn validation_error_wraps_into_provider_error() {
        let err: ProviderError = ValidationError::TemperatureOutOfRange(3.5).into();
        assert!(err.to_string().contains("3.5"));
    }

    #[test]
    fn loop_errors_name_their_context() {
        let errors = [
            Error::from(ValidationError::EmptySession),
            Error::from(ProviderError::Cancelled),
            Error::from(StreamError::Cancelled),
            Error::from(ToolError::Panicked {
                tool_name: "shell".into(),
            }),
            Error::TurnLimit(3),
        ];
        for err in &errors {
            let prefix = match err {
                Error::Validation(_) => "Validation error",
                Error::Provider(_) => "Provider error",
                Error::Stream(_) => "Stream error",
                Error::Tool(_) => "Tool dispatch error",
                Error::TurnLimit(_) => "Turn limit",
            };
            assert!(err.to_string().starts_with(prefix), "{err}");
        }
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::Panicked {
            tool_name: "shell".into(),
        });
        assert!(err.to_string().contains("shell"));
    }

    #[test]
    fn cancellation_is_distinguished_from_transport() {
        assert!(StreamError::Cancelled.is_cancellation());
        assert!(!StreamError::Transport("reset".into()).is_cancellation());
    }
}
