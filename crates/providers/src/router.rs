//! Provider router: selects the LLM backend named by config.

use std::collections::HashMap;
use std::sync::Arc;

use turnloop_config::AppConfig;
use turnloop_core::error::ProviderError;
use turnloop_core::provider::Provider;

use crate::anthropic::AnthropicProvider;
use crate::scripted::ScriptedProvider;

/// Backends this crate knows how to build.
pub const KNOWN_PROVIDERS: &[&str] = &["anthropic", "scripted"];

/// Routes requests to a named provider.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// List all registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Build one named provider from configuration.
///
/// A missing Anthropic key is not an error here; the provider reports it
/// when a turn is first requested.
pub fn build_provider(config: &AppConfig, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider_config = config.providers.get(name);

    match name {
        "anthropic" => {
            let api_key = config.api_key_for(name).unwrap_or_default();
            let mut provider = AnthropicProvider::new(api_key)?;

            let model = provider_config
                .and_then(|p| p.default_model.clone())
                .unwrap_or_else(|| config.default_model.clone());
            provider = provider.with_default_model(model);

            if let Some(url) = provider_config.and_then(|p| p.api_url.as_deref()) {
                provider = provider.with_base_url(url);
            }
            if let Some(budget) = provider_config.and_then(|p| p.thinking_budget) {
                provider = provider.with_extended_thinking(budget);
            }
            Ok(Arc::new(provider))
        }
        "scripted" => Ok(Arc::new(ScriptedProvider::echo())),
        other => Err(ProviderError::NotConfigured(format!(
            "unknown provider '{other}' (known: {})",
            KNOWN_PROVIDERS.join(", ")
        ))),
    }
}

/// Build a router holding every known provider plus the configured default.
pub fn build_from_config(config: &AppConfig) -> Result<ProviderRouter, ProviderError> {
    let mut router = ProviderRouter::new(&config.default_provider);

    for name in KNOWN_PROVIDERS {
        router.register(*name, build_provider(config, name)?);
    }

    // Surfaces a misspelt default_provider at startup
    if router.get(&config.default_provider).is_none() {
        let provider = build_provider(config, &config.default_provider)?;
        router.register(config.default_provider.clone(), provider);
    }

    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnloop_config::ProviderConfig;

    #[test]
    fn router_register_and_lookup() {
        let mut router = ProviderRouter::new("scripted");
        router.register("scripted", Arc::new(ScriptedProvider::echo()));

        assert!(router.get("scripted").is_some());
        assert!(router.get("nonexistent").is_none());
        assert_eq!(router.default().unwrap().name(), "scripted");
    }

    #[test]
    fn build_from_default_config() {
        let config = AppConfig::default();
        let router = build_from_config(&config).unwrap();
        assert_eq!(router.default().unwrap().name(), "anthropic");
        assert_eq!(router.list(), vec!["anthropic", "scripted"]);
    }

    #[test]
    fn unknown_default_provider_is_rejected() {
        let config = AppConfig {
            default_provider: "nonesuch".into(),
            ..AppConfig::default()
        };
        let err = build_from_config(&config).err().unwrap();
        assert!(matches!(err, ProviderError::NotConfigured(ref msg) if msg.contains("nonesuch")));
    }

    #[test]
    fn provider_section_is_applied() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "anthropic".into(),
            ProviderConfig {
                api_key: Some("sk-ant-test".into()),
                api_url: Some("http://127.0.0.1:9".into()),
                default_model: Some("claude-test".into()),
                thinking_budget: Some(1024),
            },
        );
        let provider = build_provider(&config, "anthropic").unwrap();
        assert_eq!(provider.name(), "anthropic");
    }
}
