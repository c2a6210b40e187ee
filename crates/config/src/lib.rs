//! Configuration loading, validation, and management for turnloop.
//!
//! Loads configuration from `~/.turnloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use turnloop_core::provider::Request;

/// The root configuration structure.
///
/// Maps directly to `~/.turnloop/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider: "anthropic" or "scripted"
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_temperature: Option<f32>,

    /// Default max tokens per model turn
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// System prompt for new sessions
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Loop behaviour
    #[serde(default)]
    pub agent: AgentConfig,

    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Session persistence
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_system_prompt() -> String {
    "You are a careful coding assistant. Use the available tools to inspect the \
     workspace before answering, and keep answers short."
        .into()
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("system_prompt", &self.system_prompt)
            .field("agent", &self.agent)
            .field("tools", &self.tools)
            .field("sessions", &self.sessions)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("thinking_budget", &self.thinking_budget)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model turns allowed per invocation
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Run sibling tool calls concurrently
    #[serde(default = "default_true")]
    pub parallel_tools: bool,
}

fn default_max_turns() -> u32 {
    25
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            parallel_tools: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub shell: ShellConfig,

    #[serde(default)]
    pub read_file: ReadFileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-command timeout
    #[serde(default = "default_shell_timeout")]
    pub timeout_secs: u64,

    /// If non-empty, only these base commands may run
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

fn default_shell_timeout() -> u64 {
    60
}
fn default_allowed_commands() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "echo", "pwd", "date", "wc", "grep", "find", "which", "git",
        "cargo", "rustc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_shell_timeout(),
            allowed_commands: default_allowed_commands(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileConfig {
    /// Largest file returned in full; longer files are truncated
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Path prefixes that may never be read
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
}

fn default_max_bytes() -> u64 {
    256 * 1024
}
fn default_forbidden_paths() -> Vec<String> {
    vec!["~/.ssh".into(), "~/.gnupg".into(), "~/.aws".into()]
}

impl Default for ReadFileConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            forbidden_paths: default_forbidden_paths(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Where session envelopes live; defaults to `~/.turnloop/sessions`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Extended thinking budget (Anthropic only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.turnloop/config.toml).
    ///
    /// Also checks environment variables:
    /// - `TURNLOOP_API_KEY` (highest priority), then `ANTHROPIC_API_KEY`
    /// - `TURNLOOP_PROVIDER`
    /// - `TURNLOOP_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("TURNLOOP_API_KEY").or_else(|| {
            self.api_key
                .is_none()
                .then(|| lookup("ANTHROPIC_API_KEY"))
                .flatten()
        }) {
            self.api_key = Some(key);
        }

        if let Some(provider) = lookup("TURNLOOP_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = lookup("TURNLOOP_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".turnloop")
    }

    /// Directory holding saved sessions.
    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions
            .dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("sessions"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Request {
            temperature: self.default_temperature,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ConfigError::ValidationError(format!("default_temperature: {e}")))?;

        if self.agent.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_turns must be > 0".into(),
            ));
        }

        if self.tools.shell.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tools.shell.timeout_secs must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// The API key for `provider`: per-provider key first, then the global one.
    pub fn api_key_for(&self, provider: &str) -> Option<String> {
        self.providers
            .get(provider)
            .and_then(|p| p.api_key.clone())
            .or_else(|| self.api_key.clone())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key_for(&self.default_provider).is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: None,
            default_max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            sessions: SessionsConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.agent.max_turns, 25);
        assert!(config.agent.parallel_tools);
        assert!(config.tools.shell.allowed_commands.contains(&"git".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.tools.shell.timeout_secs, config.tools.shell.timeout_secs);
        assert_eq!(parsed.system_prompt, config.system_prompt);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: Some(3.5),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn temperature_bounds_match_request_validation() {
        for (temperature, ok) in [(0.0, true), (2.0, true), (f32::NAN, false), (-0.1, false)] {
            let config = AppConfig {
                default_temperature: Some(temperature),
                ..AppConfig::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "temperature {temperature}");
        }
        let err = AppConfig {
            default_temperature: Some(f32::INFINITY),
            ..AppConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("default_temperature"));
    }

    #[test]
    fn zero_limits_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_turns = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tools.shell.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.default_provider, "anthropic");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
default_provider = "scripted"
default_temperature = 0.5

[agent]
max_turns = 4

[providers.anthropic]
api_key = "sk-ant-file"
thinking_budget = 2048
"#
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.default_provider, "scripted");
        assert_eq!(config.default_temperature, Some(0.5));
        assert_eq!(config.agent.max_turns, 4);
        assert!(config.agent.parallel_tools);
        assert_eq!(config.tools.shell.timeout_secs, 60);
        assert_eq!(
            config.api_key_for("anthropic").as_deref(),
            Some("sk-ant-file")
        );
        assert_eq!(config.providers["anthropic"].thinking_budget, Some(2048));
    }

    #[test]
    fn invalid_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "default_provider = [").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(env(&[
            ("ANTHROPIC_API_KEY", "sk-ant-env"),
            ("TURNLOOP_PROVIDER", "scripted"),
            ("TURNLOOP_MODEL", "claude-test"),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("sk-ant-env"));
        assert_eq!(config.default_provider, "scripted");
        assert_eq!(config.default_model, "claude-test");
    }

    #[test]
    fn turnloop_key_beats_file_and_anthropic_key() {
        let mut config = AppConfig {
            api_key: Some("sk-file".into()),
            ..AppConfig::default()
        };
        config.apply_env(env(&[("ANTHROPIC_API_KEY", "sk-ant-env")]));
        assert_eq!(config.api_key.as_deref(), Some("sk-file"));

        config.apply_env(env(&[
            ("TURNLOOP_API_KEY", "sk-turnloop"),
            ("ANTHROPIC_API_KEY", "sk-ant-env"),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("sk-turnloop"));
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = AppConfig {
            api_key: Some("sk-secret-value".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "anthropic".into(),
            ProviderConfig {
                api_key: Some("sk-provider-secret".into()),
                ..ProviderConfig::default()
            },
        );
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-value"));
        assert!(!debug.contains("sk-provider-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("anthropic"));
        assert!(toml_str.contains("max_turns"));
    }

    #[test]
    fn sessions_dir_override() {
        let config = AppConfig {
            sessions: SessionsConfig {
                dir: Some(PathBuf::from("/var/lib/turnloop")),
            },
            ..AppConfig::default()
        };
        assert_eq!(config.sessions_dir(), PathBuf::from("/var/lib/turnloop"));
        assert!(AppConfig::default().sessions_dir().ends_with(".turnloop/sessions"));
    }
}
