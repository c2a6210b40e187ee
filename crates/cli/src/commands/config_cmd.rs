//! `turnloop config`: configuration management commands.

use anyhow::Context;
use turnloop_config::AppConfig;

pub fn show() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    // Secrets stay out of terminal scrollback
    let mut shown = config.clone();
    if shown.api_key.is_some() {
        shown.api_key = Some("[REDACTED]".into());
    }
    for provider in shown.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("[REDACTED]".into());
        }
    }
    println!("{}", toml::to_string_pretty(&shown)?);

    if !config.has_api_key() && config.default_provider == "anthropic" {
        eprintln!("warning: no API key set (TURNLOOP_API_KEY or ANTHROPIC_API_KEY)");
    }
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

pub fn init() -> anyhow::Result<()> {
    let dir = AppConfig::config_dir();
    let path = dir.join("config.toml");
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::write(&path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
