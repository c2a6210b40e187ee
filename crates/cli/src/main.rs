//! turnloop CLI: the main entry point.
//!
//! Commands:
//! - `run`       Send a message (or read lines from stdin) and stream the answer
//! - `sessions`  List saved sessions, newest first
//! - `config`    Show, locate, or initialize the configuration file

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "turnloop",
    about = "turnloop: a streaming, tool-using coding agent",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Talk to the agent
    Run {
        /// Send a single message instead of reading lines from stdin
        #[arg(short, long)]
        message: Option<String>,

        /// Resume the session with this id
        #[arg(long, conflicts_with = "continue_latest")]
        resume: Option<String>,

        /// Resume the most recently updated session
        #[arg(short = 'c', long = "continue")]
        continue_latest: bool,
    },

    /// List saved sessions
    Sessions {
        /// Show at most this many
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Write a default config file if none exists
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so streamed answers on stdout stay clean
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            message,
            resume,
            continue_latest,
        } => {
            let resume = match (resume, continue_latest) {
                (Some(id), _) => commands::run::Resume::Id(id),
                (None, true) => commands::run::Resume::Latest,
                (None, false) => commands::run::Resume::New,
            };
            commands::run::run(message, resume).await?
        }
        Commands::Sessions { limit } => commands::sessions::run(limit)?,
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config_cmd::show()?,
            ConfigAction::Path => commands::config_cmd::path(),
            ConfigAction::Init => commands::config_cmd::init()?,
        },
    }

    Ok(())
}
