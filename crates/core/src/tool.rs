//! Tool execution contract.
//!
//! The loop only ever talks to a [`ToolExecutor`]: one call, one result.
//! Anything a tool can report about its own failure travels back inside the
//! [`ToolResult`] with `is_error` set, so the model sees it and can react.
//! An `Err` from `execute` is reserved for a broken executor and aborts the
//! whole run.
//!
//! [`ToolRegistry`] is the stock executor: it dispatches by name to
//! registered [`Tool`]s and turns every per-tool problem into an error
//! result.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ToolError, ValidationError};
use crate::message::ContentBlock;
use crate::provider::ToolDefinition;

/// The outcome of one tool call, as the model will see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

impl ToolResult {
    /// A successful result with a single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: false,
        }
    }

    /// A failed result the model should see.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: true,
        }
    }

    pub fn with_content(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }
}

/// Runs one tool call.
///
/// May be invoked concurrently for sibling calls of a single assistant
/// message, so implementations must be safe to share across tasks.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: CancellationToken,
        name: &str,
        arguments: &str,
    ) -> std::result::Result<ToolResult, ToolError>;
}

/// A single named capability.
///
/// Each tool (shell, read_file, ...) implements this trait and is registered
/// in a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-parsed arguments.
    ///
    /// A returned `Err` is converted to an error result by the registry.
    async fn execute(
        &self,
        cancel: CancellationToken,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Name-dispatching [`ToolExecutor`].
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Empty or already-registered names are rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> std::result::Result<(), ValidationError> {
        let name = tool.name().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptyToolName);
        }
        if self.tools.contains_key(&name) {
            return Err(ValidationError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Definitions for every registered tool, sorted by name so requests are
    /// stable from turn to turn.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(
        &self,
        cancel: CancellationToken,
        name: &str,
        arguments: &str,
    ) -> std::result::Result<ToolResult, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = %name, "Model requested an unknown tool");
            return Ok(ToolResult::error(format!("Unknown tool: {name}")));
        };

        let raw = if arguments.trim().is_empty() {
            "{}"
        } else {
            arguments
        };
        let parsed: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!(tool = %name, error = %e, "Tool arguments are not valid JSON");
                return Ok(ToolResult::error(format!(
                    "Invalid arguments for {name}: {e}"
                )));
            }
        };

        match tool.execute(cancel, parsed).await {
            Ok(result) => Ok(result),
            Err(e) => {
                debug!(tool = %name, error = %e, "Tool reported a failure");
                Ok(ToolResult::error(e.to_string()))
            }
        }
    }
}
