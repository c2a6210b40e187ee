//! `turnloop run`: one message, or a line-per-message loop over stdin.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, bail};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use turnloop_agent::{AgentLoop, LoopOptions};
use turnloop_config::AppConfig;
use turnloop_core::error::{Error, ValidationError};
use turnloop_core::event::{AgentEvent, EventSink};
use turnloop_core::message::{Message, StopReason};
use turnloop_core::session::Session;
use turnloop_core::stream::Event;
use turnloop_store::SessionStore;

/// Which session `run` works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    New,
    Latest,
    Id(String),
}

pub async fn run(message: Option<String>, resume: Resume) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;

    if config.default_provider == "anthropic" && !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set TURNLOOP_API_KEY or ANTHROPIC_API_KEY, or add api_key to");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        eprintln!("  To try turnloop offline, use TURNLOOP_PROVIDER=scripted.");
        eprintln!();
        bail!("No API key found. See above for setup instructions.");
    }

    let store = SessionStore::new(config.sessions_dir());
    let mut session = match &resume {
        Resume::New => Session::new(&config.system_prompt),
        Resume::Latest => store.latest().context("Failed to load latest session")?,
        Resume::Id(id) => store
            .load(id)
            .with_context(|| format!("Failed to load session {id}"))?,
    };

    let provider = turnloop_providers::build_provider(&config, &config.default_provider)?;
    let workspace = std::env::current_dir().context("Failed to read working directory")?;
    let tools = turnloop_tools::default_registry(&workspace, &config.tools)?;
    let definitions = tools.definitions();

    let agent = AgentLoop::new(provider, Arc::new(tools), definitions)
        .with_options(LoopOptions {
            model: Some(config.default_model.clone()),
            max_tokens: Some(config.default_max_tokens),
            temperature: config.default_temperature,
            max_turns: config.agent.max_turns,
            parallel_tools: config.agent.parallel_tools,
        })
        .with_sink(Arc::new(TerminalSink::new(std::io::stdout())));

    info!(
        session_id = %session.id(),
        provider = %config.default_provider,
        model = %config.default_model,
        resumed = resume != Resume::New,
        "Starting run"
    );

    match message {
        Some(text) => {
            let outcome = invoke(&agent, &store, &mut session, text).await;
            eprintln!("  session: {}", session.id());
            outcome
        }
        None => {
            repl(&agent, &store, &mut session).await?;
            eprintln!("  session: {}", session.id());
            Ok(())
        }
    }
}

async fn repl(agent: &AgentLoop, store: &SessionStore, session: &mut Session) -> anyhow::Result<()> {
    eprintln!("  turnloop: one message per line, Ctrl-D or 'exit' to quit.");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        // A failed invocation is reported and the conversation goes on,
        // unless the transcript can no longer be continued
        if let Err(e) = invoke(agent, store, session, line.to_string()).await {
            eprintln!("  [error] {e:#}");
            if session_is_stuck(&e) {
                eprintln!("  This session cannot continue; start a new one with `turnloop run`.");
                break;
            }
        }
    }
    Ok(())
}

/// Failures that leave tool calls without results. Every later turn on the
/// same session is rejected until the transcript is repaired.
fn session_is_stuck(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<Error>(),
        Some(Error::Tool(_) | Error::Validation(ValidationError::MissingToolResult { .. }))
    )
}

/// Append `text`, run the loop to completion, and save whatever happened.
async fn invoke(
    agent: &AgentLoop,
    store: &SessionStore,
    session: &mut Session,
    text: String,
) -> anyhow::Result<()> {
    session.append(Message::user(text));

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = agent.run(session, cancel).await;
    watcher.abort();
    println!();

    let saved = store.save(session);

    let outcome = result?;
    saved.context("Failed to save session")?;

    match outcome.stop_reason {
        StopReason::EndTurn | StopReason::ToolUse => {}
        StopReason::Aborted => eprintln!("  [aborted]"),
        StopReason::Length => eprintln!("  [stopped: output token limit]"),
        StopReason::Error => eprintln!("  [stream error]"),
        StopReason::Unknown => eprintln!("  [stopped: unrecognized stop reason]"),
    }
    Ok(())
}

/// Renders loop events for a terminal: answer text as it streams, plus one
/// line per tool call.
pub struct TerminalSink<W> {
    state: Mutex<TerminalState<W>>,
}

struct TerminalState<W> {
    out: W,
    mid_line: bool,
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            state: Mutex::new(TerminalState {
                out,
                mid_line: false,
            }),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .out
    }
}

impl<W: Write + Send> EventSink for TerminalSink<W> {
    fn emit(&self, event: &AgentEvent) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            AgentEvent::Delta(Event::TextDelta { text, .. }) => {
                write!(state.out, "{text}")?;
                state.mid_line = !text.ends_with('\n');
            }
            AgentEvent::ToolStarted {
                name, arguments, ..
            } => {
                if state.mid_line {
                    writeln!(state.out)?;
                }
                let arguments: String = arguments.chars().take(120).collect();
                writeln!(state.out, "  [{name}] {arguments}")?;
                state.mid_line = false;
            }
            AgentEvent::ToolFinished {
                name,
                is_error: true,
                ..
            } => {
                writeln!(state.out, "  [{name}] failed")?;
                state.mid_line = false;
            }
            _ => {}
        }
        state.out.flush()?;
        Ok(())
    }
}
