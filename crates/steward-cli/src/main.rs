mod models;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use steward_config::{find_config_path, load_config, save_config, Config};
use steward_core::task::{self, RunOutcome};
use steward_core::{AgentEvent, AgentLoop};
use steward_server::AppState;
use tokio::sync::mpsc;

/// Render markdown text to the terminal using termimad.
fn render_markdown(text: &str) {
    let skin = termimad::MadSkin::default();
    skin.print_text(text);
}

#[derive(Parser)]
#[command(name = "steward", about = "Operations assistant with durable background tasks", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant
    Chat {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,

        /// Session ID for conversation tracking
        #[arg(short, long, default_value = "cli:interactive")]
        session: String,
    },
    /// Start the HTTP API
    Serve,
    /// Control background collection runs
    Task {
        #[command(subcommand)]
        action: TaskCommands,
    },
    /// Write a default config and create the workspace
    Onboard,
    /// Show configuration and store status
    Status,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a run and drive it in the foreground
    Start {
        /// Query for the first iteration (defaults to collector.defaultQuery)
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Continue an existing run from its latest checkpoint
    Resume {
        id: String,
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Ask a run to stop
    Stop { id: String },
    /// Show a run and its latest checkpoint
    Status { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},steward_core::agent=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Onboard => run_onboard(&config_path),
        Commands::Status => run_status(&config_path),
        Commands::Chat { message, session } => {
            let config = load_config(&config_path)?;
            let provider = models::create_provider(&config)?;
            let state = AppState::build(&config, Some(provider))?;
            let agent = state
                .agent
                .clone()
                .context("agent was not initialised")?;
            match message {
                Some(msg) => run_turn(&agent, &session, &state.owner_id, &msg).await,
                None => run_interactive(&state, &agent, &session).await,
            }
        }
        Commands::Serve => {
            let config = load_config(&config_path)?;
            let provider = match models::create_provider(&config) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!("{e:#}");
                    None
                }
            };
            let state = AppState::build(&config, provider)?;
            steward_server::serve(state, &config.gateway).await
        }
        Commands::Task { action } => {
            let config = load_config(&config_path)?;
            run_task_command(action, &config).await
        }
    }
}

/// Run one turn, printing tool activity as it happens and the reply at the end.
async fn run_turn(agent: &AgentLoop, session: &str, owner_id: &str, input: &str) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Tool { name, result, .. } = event {
                let status = result
                    .get("status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("error");
                println!("  [{name}] {status}");
                if let Some(id) = result.get("invocationId").and_then(|v| v.as_str()) {
                    println!("  approve with `/approve {id}` or reply to confirm");
                }
            }
        }
    });

    let outcome = agent.process_message(session, owner_id, input, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;

    let outcome = outcome?;
    println!();
    render_markdown(&outcome.text);
    println!();
    Ok(())
}

async fn run_interactive(state: &AppState, agent: &AgentLoop, session: &str) -> Result<()> {
    let history_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".steward")
        .join("history");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join("cli_history");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    let mut session = session.to_string();
    println!("steward interactive mode (type /help for commands, Ctrl-D to quit)");
    println!();

    let result = loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if matches!(input, "exit" | "quit" | "/exit" | "/quit" | ":q") {
                    break Ok(());
                }

                if input.starts_with('/') {
                    handle_slash_command(state, input, &mut session).await;
                    continue;
                }

                if let Err(e) = run_turn(agent, &session, &state.owner_id, input).await {
                    eprintln!("Error: {e:#}");
                    println!();
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break Ok(());
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break Ok(());
            }
        }
    };

    let _ = rl.save_history(&history_path);
    result
}

async fn handle_slash_command(state: &AppState, input: &str, session: &mut String) {
    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();

    match (command, arg) {
        ("/help", _) => {
            println!("Commands:");
            println!("  /new          - Start a new session");
            println!("  /pending      - List tool calls awaiting approval");
            println!("  /approve <id> - Approve and run a pending tool call");
            println!("  /reject <id>  - Reject a pending tool call");
            println!("  /quit         - Exit");
        }
        ("/new", _) => {
            *session = format!("cli:{}", chrono::Utc::now().format("%Y%m%d%H%M%S"));
            println!("New session: {session}");
        }
        ("/pending", _) => {
            let pending = state.gateway.pending();
            if pending.is_empty() {
                println!("Nothing awaiting approval.");
            }
            for inv in pending {
                println!("  {}  {}  {}", inv.id, inv.tool, inv.args);
            }
        }
        ("/approve", Some(id)) => match state.gateway.approve(id).await {
            Ok(result) => println!("{}", result.to_value()),
            Err(e) => println!("Could not approve: {e}"),
        },
        ("/reject", Some(id)) => match state.gateway.reject(id) {
            Ok(inv) => println!("Rejected {} ({})", inv.id, inv.tool),
            Err(e) => println!("Could not reject: {e}"),
        },
        _ => println!("Unknown command. Type /help for commands."),
    }
    println!();
}

async fn run_task_command(action: TaskCommands, config: &Config) -> Result<()> {
    match action {
        TaskCommands::Start { query } => {
            let state = AppState::build(config, Some(models::create_provider(config)?))?;
            let run = task::start_run(state.store.as_ref(), &state.owner_id).await?;
            println!("Started task run {}", run.id);
            drive_run(&state, &run.id, query.as_deref()).await
        }
        TaskCommands::Resume { id, query } => {
            let state = AppState::build(config, Some(models::create_provider(config)?))?;
            let run = task::resume_run(state.store.as_ref(), &id).await?;
            println!("Resuming task run {} ({})", run.id, run.status.as_str());
            drive_run(&state, &id, query.as_deref()).await
        }
        TaskCommands::Stop { id } => {
            let state = AppState::build(config, None)?;
            task::stop_run(state.store.as_ref(), &id).await?;
            println!("Stop requested for task run {id}.");
            Ok(())
        }
        TaskCommands::Status { id } => {
            let state = AppState::build(config, None)?;
            match task::run_status(state.store.as_ref(), &id).await? {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => println!("No task run with id {id}."),
            }
            Ok(())
        }
    }
}

/// Drive a run until it ends or Ctrl-C. An interrupted run keeps its
/// checkpoints, hands its lease back and can be resumed.
async fn drive_run(state: &AppState, id: &str, query: Option<&str>) -> Result<()> {
    let tasks = state
        .tasks
        .clone()
        .context("collector was not initialised")?;

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    match tasks.executor().run_until(id, query, interrupt).await? {
        RunOutcome::Completed { iterations } => {
            println!("Task run {id} completed after {iterations} iteration(s).")
        }
        RunOutcome::Stopped { iterations } => {
            println!("Task run {id} stopped after {iterations} iteration(s).")
        }
        RunOutcome::Interrupted { iterations } => {
            println!();
            println!(
                "Interrupted after {iterations} iteration(s). Resume with `steward task resume {id}`."
            );
        }
    }
    Ok(())
}

/// Write a default config and create the workspace.
fn run_onboard(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `steward onboard` again.");
    } else {
        save_config(config_path, &Config::default())?;
        println!("Created config: {}", config_path.display());
    }

    let config = load_config(config_path)?;
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)?;
    println!("Workspace: {}", workspace.display());

    let persona = workspace.join("PERSONA.md");
    if !persona.exists() {
        std::fs::write(
            &persona,
            "# Persona\n\nDescribe how the assistant should behave and who it works for.\n",
        )?;
        println!("  Created PERSONA.md (set agents.defaults.persona to \"PERSONA.md\" to use it)");
    }

    println!();
    println!("Setup complete! Next steps:");
    println!(
        "  1. Edit {} and set agents.models.capable (and optionally light)",
        config_path.display()
    );
    println!("  2. Run `steward chat` to start chatting");
    println!();
    Ok(())
}

/// Credentials have already been filled from the environment by `load_config`.
fn configured(value: &str) -> &'static str {
    if !value.is_empty() {
        "configured"
    } else {
        "not configured"
    }
}

/// Show system status and configuration summary.
fn run_status(config_path: &Path) -> Result<()> {
    println!("steward status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, run `steward onboard`)",
            config_path.display()
        );
        return Ok(());
    }

    let config = load_config(config_path)?;
    let workspace = config.workspace_dir();
    let store = config.database_path();
    let found = |p: &Path| if p.exists() { "found" } else { "not found" };
    println!("  Workspace: {} ({})", workspace.display(), found(&workspace));
    println!("  Store:     {} ({})", store.display(), found(&store));
    println!();

    println!("  Models:");
    for tier in ["light", "capable"] {
        match config.agents.models.get(tier) {
            Some(m) => println!("    {tier}: {} / {}", m.provider, m.model),
            None if tier == "light" => println!("    {tier}: (uses capable)"),
            None => println!("    {tier}: (not set)"),
        }
    }
    println!(
        "    Step budget: {}",
        config.agents.defaults.max_tool_iterations
    );
    println!();

    let tools = &config.tools;
    println!("  Tools:");
    println!(
        "    Tavily search: {}",
        configured(&tools.search.api_key)
    );
    println!(
        "    GitHub: {} ({}/{})",
        configured(&tools.github.token),
        tools.github.owner,
        tools.github.repo
    );
    println!(
        "    Vercel: {}",
        configured(&tools.vercel.token)
    );
    println!("    Script timeout: {}s", tools.script.timeout_secs);
    println!();

    println!(
        "  Collector: max {} iteration(s), every {}s, at most {}h",
        config.collector.max_iterations,
        config.collector.interval_secs,
        config.collector.max_duration_hours
    );
    println!(
        "  Gateway:   http://{}:{}",
        config.gateway.host, config.gateway.port
    );

    Ok(())
}
