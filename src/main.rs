// ABOUTME: Command-line front end for switchboard backends.
// ABOUTME: Lists configured backends and streams one prompt's unified messages to the terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use switchboard_agent::config::Config;
use switchboard_agent::{
    AgentRegistry, PermissionDecision, PermissionRequest, SessionConfig, SharedBackend,
    ToolStatus, UnifiedMessage,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "switchboard", version, about = "Drive coding-agent backends through one contract")]
struct Cli {
    /// Config file (default: ./switchboard.toml, then ~/.config/switchboard/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured backends and the backend types this build supports
    List,

    /// Send one prompt and stream the reply
    Prompt {
        /// Backend name from the config file
        backend: String,

        /// Prompt text
        text: String,

        /// Model for the session
        #[arg(long)]
        model: Option<String>,

        /// Working directory for the session
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Approve every permission prompt without asking
        #[arg(long, conflicts_with = "auto_deny")]
        auto_approve: bool,

        /// Deny every permission prompt without asking
        #[arg(long)]
        auto_deny: bool,

        /// Print each unified message as a JSON line
        #[arg(long)]
        json: bool,
    },
}

/// How permission prompts get answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissionPolicy {
    Ask,
    Approve,
    Deny,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let loaded = Config::find_and_load(cli.config.as_deref())?;

    match cli.command {
        Command::List => list(loaded),
        Command::Prompt {
            backend,
            text,
            model,
            cwd,
            auto_approve,
            auto_deny,
            json,
        } => {
            let policy = match (auto_approve, auto_deny) {
                (true, _) => PermissionPolicy::Approve,
                (_, true) => PermissionPolicy::Deny,
                _ => PermissionPolicy::Ask,
            };
            let session = SessionConfig {
                cwd,
                model,
                ..Default::default()
            };
            prompt(loaded, &backend, &text, session, policy, json).await
        }
    }
}

/// Logs go to stderr so stdout carries only the agent's reply
fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

fn list(loaded: Option<(PathBuf, Config)>) -> Result<()> {
    let registry = AgentRegistry::default();
    println!("Backend types: {}", registry.available().join(", "));

    let Some((path, config)) = loaded else {
        println!("No config file found");
        return Ok(());
    };
    println!("Config: {}", path.display());
    if config.backends.is_empty() {
        println!("  (no backends configured)");
    }
    for (name, backend) in &config.backends {
        println!("  {name} ({})", backend.backend_type());
    }
    Ok(())
}

async fn prompt(
    loaded: Option<(PathBuf, Config)>,
    name: &str,
    text: &str,
    session_config: SessionConfig,
    policy: PermissionPolicy,
    json: bool,
) -> Result<()> {
    let (path, config) =
        loaded.context("No config file found; pass --config or create ./switchboard.toml")?;
    let backend_config = config
        .backend(name)
        .with_context(|| format!("Backend {name:?} is not defined in {}", path.display()))?;
    let backend = AgentRegistry::default()
        .create_from_config(name, backend_config)
        .with_context(|| format!("Failed to create backend {name:?}"))?;

    let answering = answer_permissions(Arc::clone(&backend), policy);
    let outcome = run_prompt(&backend, text, session_config, json).await;

    answering.abort();
    backend.disconnect().await;
    outcome
}

async fn run_prompt(
    backend: &SharedBackend,
    text: &str,
    session_config: SessionConfig,
    json: bool,
) -> Result<()> {
    backend
        .initialize()
        .await
        .with_context(|| format!("Backend {} failed to initialize", backend.name()))?;
    let session = backend
        .new_session(session_config)
        .await
        .context("Failed to create session")?;
    tracing::debug!(%session, "Session ready");

    let mut receiver = backend
        .prompt(&session, text)
        .await
        .context("Failed to send prompt")?;

    let mut failure = None;
    loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message else { break };
                render(&message, json)?;
                if let UnifiedMessage::Error { message } = &message {
                    failure = Some(message.clone());
                }
                if message.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("[cancelling]");
                backend.cancel_prompt(&session).await.context("Failed to cancel prompt")?;
            }
        }
    }

    match failure {
        Some(message) => anyhow::bail!("Prompt failed: {message}"),
        None => Ok(()),
    }
}

fn render(message: &UnifiedMessage, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(message)?);
        return Ok(());
    }

    let mut stdout = io::stdout().lock();
    match message {
        UnifiedMessage::Text { text } => {
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
        UnifiedMessage::Reasoning { text } => eprint!("{text}"),
        UnifiedMessage::ToolCall { name, status, .. } => {
            eprintln!("[tool {name}: {}]", status_label(*status));
        }
        UnifiedMessage::ToolResult {
            id,
            output,
            status: ToolStatus::Failed,
        } => eprintln!("[tool {id} failed: {output}]"),
        UnifiedMessage::ToolResult { .. } => {}
        UnifiedMessage::TurnComplete { stop_reason } => {
            writeln!(stdout)?;
            eprintln!("[done: {stop_reason}]");
        }
        UnifiedMessage::Error { message } => eprintln!("[error: {message}]"),
    }
    Ok(())
}

fn status_label(status: ToolStatus) -> &'static str {
    match status {
        ToolStatus::Pending => "pending",
        ToolStatus::InProgress => "running",
        ToolStatus::Completed => "done",
        ToolStatus::Failed => "failed",
    }
}

/// Route permission prompts to a task that answers them per `policy`
fn answer_permissions(backend: SharedBackend, policy: PermissionPolicy) -> JoinHandle<()> {
    let (tx, mut requests) = mpsc::unbounded_channel();
    backend.on_permission_request(Arc::new(move |request: PermissionRequest| {
        let _ = tx.send(request);
    }));

    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let decision = match policy {
                PermissionPolicy::Approve => PermissionDecision::Approved,
                PermissionPolicy::Deny => PermissionDecision::Denied,
                PermissionPolicy::Ask => {
                    let question = describe(&request);
                    match tokio::task::spawn_blocking(move || ask(&question)).await {
                        Ok(Ok(decision)) => decision,
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Failed to read permission answer");
                            PermissionDecision::Abort
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Permission prompt task failed");
                            PermissionDecision::Abort
                        }
                    }
                }
            };

            tracing::info!(request_id = %request.id, %decision, "Answering permission prompt");
            if !backend.respond_to_permission(&request.session_id, &request.id, decision.into()) {
                tracing::debug!(request_id = %request.id, "Permission prompt already settled");
            }
        }
    })
}

fn describe(request: &PermissionRequest) -> String {
    let mut question = format!("[permission] {}", request.title);
    if let Some(kind) = &request.kind {
        question.push_str(&format!(" ({kind})"));
    }
    if !request.raw_input.is_null() {
        question.push_str(&format!("\n  input: {}", request.raw_input));
    }
    question
}

fn ask(question: &str) -> io::Result<PermissionDecision> {
    {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{question}\n  [y]es / [a]lways / [n]o / [c]ancel: ")?;
        stderr.flush()?;
    }
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(PermissionDecision::Abort);
    }
    Ok(parse_answer(&line))
}

fn parse_answer(line: &str) -> PermissionDecision {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => PermissionDecision::Approved,
        "a" | "always" => PermissionDecision::ApprovedForSession,
        "n" | "no" => PermissionDecision::Denied,
        _ => PermissionDecision::Abort,
    }
}
