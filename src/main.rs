//! CLI entry point for `codeloop`.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dotenvy::dotenv;
use futures_util::StreamExt;

use codeloop::app::{App, compact_if_needed};
use codeloop::config::{AgentRole, Config};
use codeloop::core::{AgentEvent, AgentEventStream};
use codeloop::error_taxonomy::ErrorEnvelope;
use codeloop::logging;
use codeloop::models::ModelRegistry;
use codeloop::pricing::format_cost;
use codeloop::pubsub::Broker;

#[derive(Parser, Debug)]
#[command(
    name = "codeloop",
    author,
    version,
    about = "Coding agent loop over interchangeable model backends"
)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,

    /// Send a one-shot prompt (non-interactive, tools auto-approved)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Continue a saved session by ID
    #[arg(short, long)]
    session: Option<String>,

    /// Model for the coder role
    #[arg(short, long)]
    model: Option<String>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config profile name
    #[arg(long)]
    profile: Option<String>,

    /// Workspace directory for file operations
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// List known models
    Models,
    /// List saved sessions
    Sessions {
        /// Maximum number of sessions to display
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    if let Some(Commands::Models) = cli.command {
        list_models();
        return Ok(());
    }

    let config = load_config_from_cli(&cli)?;
    let logs = Broker::new();
    logging::init(cli.verbose, cli.log_file.as_deref(), Some(logs.clone()))?;
    let app = App::new(config, logs)?;

    let result = match (&cli.command, cli.prompt.as_deref()) {
        (Some(Commands::Sessions { limit }), _) => list_sessions(&app, *limit),
        (_, Some(prompt)) => run_one_shot(&app, cli.session.as_deref(), prompt).await,
        _ => bail!("No prompt given. Pass one with -p/--prompt."),
    };
    app.shutdown();
    result
}

fn load_config_from_cli(cli: &Cli) -> Result<Config> {
    let profile = cli
        .profile
        .clone()
        .or_else(|| std::env::var("CODELOOP_PROFILE").ok());
    let mut config = Config::load(cli.config.clone(), profile.as_deref())?;
    if let Some(workspace) = &cli.workspace {
        config.working_dir = Some(workspace.display().to_string());
    }
    if let Some(model) = &cli.model {
        config
            .agents
            .entry(AgentRole::Coder.as_str().to_string())
            .or_default()
            .model = Some(model.clone());
        config.validate()?;
    }
    Ok(config)
}

fn list_models() {
    println!("{}", "Models".bold());
    for model in ModelRegistry::builtin().list() {
        println!(
            "  {:<32} {:<12} {:>8} ctx  {}",
            model.id,
            model.provider.as_str(),
            model.context_window,
            model.name.dimmed()
        );
    }
}

fn list_sessions(app: &App, limit: usize) -> Result<()> {
    let sessions = app.sessions.list_persisted()?;
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }
    for session in sessions.iter().take(limit) {
        println!(
            "  {}  {:<40} {:>4} msgs {:>8} tok {}",
            session.id.dimmed(),
            session.title,
            session.message_count,
            session.total_tokens(),
            format_cost(session.cost)
        );
    }
    if sessions.len() > limit {
        println!(
            "  {} more session(s). Use --limit to show more.",
            sessions.len() - limit
        );
    }
    Ok(())
}

async fn run_one_shot(app: &App, session_id: Option<&str>, prompt: &str) -> Result<()> {
    let session = match session_id {
        Some(id) => match app.agent.switch_session(id) {
            Ok(session) => session,
            Err(err) => return report(err.into()),
        },
        None => app.sessions.create(""),
    };
    app.permissions.auto_approve_session(&session.id);

    let events = match app.agent.run(&session.id, prompt) {
        Ok(events) => events,
        Err(err) => return report(err.into()),
    };
    if !drain(app, &session.id, events).await? {
        return Ok(());
    }

    if let Some(started) = compact_if_needed(&app.agent, &app.sessions, &session.id, app.compaction())
    {
        match started {
            Ok(events) => {
                eprintln!("{}", "Context nearly full; summarizing session...".dimmed());
                drain(app, &session.id, events).await?;
            }
            Err(err) => return report(err.into()),
        }
    }

    if let Some(session) = app.sessions.get(&session.id) {
        eprintln!(
            "{}",
            format!(
                "session {}  {} tokens  {}",
                session.id,
                session.total_tokens(),
                format_cost(session.cost)
            )
            .dimmed()
        );
    }
    Ok(())
}

/// Print one call's events until it ends. Returns true on success.
async fn drain(app: &App, session_id: &str, mut events: AgentEventStream) -> Result<bool> {
    let mut stdout = io::stdout();
    let mut streamed = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                app.agent.cancel(session_id);
            }
            event = events.next() => match event {
                Some(AgentEvent::Progress { message_id: Some(_), text, .. }) => {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                    streamed = true;
                }
                Some(AgentEvent::Progress { text, .. }) => {
                    eprintln!("{}", text.dimmed());
                }
                Some(AgentEvent::Done { message, .. }) => {
                    if streamed {
                        writeln!(stdout)?;
                    } else {
                        writeln!(stdout, "{}", message.text())?;
                    }
                    return Ok(true);
                }
                Some(AgentEvent::Error { error, .. }) => {
                    if streamed {
                        writeln!(stdout)?;
                    }
                    report(error.into())?;
                    return Ok(false);
                }
                None => return Ok(false),
            }
        }
    }
}

/// Print an error as a status line; cancellation is not a failure.
fn report(envelope: ErrorEnvelope) -> Result<()> {
    if envelope.is_cancelled() {
        eprintln!("{}", envelope.status_line().yellow());
        return Ok(());
    }
    eprintln!("{}", envelope.status_line().red());
    std::process::exit(1);
}
