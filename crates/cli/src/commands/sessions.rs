//! `turnloop sessions`: list saved sessions.

use anyhow::Context;
use turnloop_config::AppConfig;
use turnloop_store::SessionStore;

pub fn run(limit: usize) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    let store = SessionStore::new(config.sessions_dir());
    let sessions = store.list().context("Failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions in {}", store.root().display());
        return Ok(());
    }

    for summary in sessions.iter().take(limit) {
        let preview = summary.preview.as_deref().unwrap_or("");
        let preview: String = preview.chars().take(60).collect();
        println!(
            "{}  {}  {:>4} msgs  {}",
            summary.id,
            summary
                .updated_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
            summary.message_count,
            preview
        );
    }
    Ok(())
}
