//! Built-in tool implementations for turnloop.
//!
//! Tools give the agent a view of its workspace: read files and run
//! shell commands. Both are confined to the workspace directory.

pub mod path;
pub mod read_file;
pub mod shell;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use turnloop_config::ToolsConfig;
use turnloop_core::error::ValidationError;
use turnloop_core::tool::ToolRegistry;

pub use read_file::ReadFileTool;
pub use shell::ShellTool;

/// Create a tool registry with the built-in tools enabled in `config`.
///
/// `read_file` is always present; `shell` only when enabled.
pub fn default_registry(
    workspace: impl Into<PathBuf>,
    config: &ToolsConfig,
) -> Result<ToolRegistry, ValidationError> {
    let workspace = workspace.into();
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(
        ReadFileTool::new(&workspace)
            .with_max_bytes(config.read_file.max_bytes)
            .with_forbidden_paths(config.read_file.forbidden_paths.clone()),
    ))?;

    if config.shell.enabled {
        registry.register(Arc::new(
            ShellTool::new(&workspace, config.shell.allowed_commands.clone())
                .with_timeout(Duration::from_secs(config.shell.timeout_secs)),
        ))?;
    }

    Ok(registry)
}
