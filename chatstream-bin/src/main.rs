use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chatstream_core::{
    ChatSession, ChatSnapshot, TurnOutcome,
    config::Config,
    model::{Role, ToolCallState, ToolStatus},
    observer::ChatObserver,
    telemetry::TracingSink,
    transport::{ChatTransport, HttpTransport, ReplayTransport},
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "agent chat streaming client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and stream the agent's reply (Ctrl-C cancels)
    Chat {
        #[arg(long, help = "Config file (.json or .toml)")]
        config: PathBuf,
        #[arg(long, help = "Agent id (overrides config)")]
        agent: Option<String>,
        #[arg(long, help = "Workspace id (overrides config)")]
        workspace: Option<String>,
        #[arg(long, help = "Continue an existing conversation")]
        conversation: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Fold a captured text/event-stream body and print the final snapshot
    Replay {
        file: PathBuf,
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
        #[arg(short, long, default_value = "replay")]
        message: String,
    },
}

/// Prints tool activity and new conversations to stderr.
struct CliObserver;

impl ChatObserver for CliObserver {
    fn on_conversation_started(&self, conversation_id: &str) {
        eprintln!("[conversation {conversation_id}]");
    }

    fn on_tool_start(&self, call: &ToolCallState) {
        eprintln!("[tool {} {}: running]", call.tool_name, call.id);
    }

    fn on_tool_result(&self, call: &ToolCallState) {
        let status = match call.status {
            ToolStatus::Error => "error",
            _ => "completed",
        };
        match call.duration_ms {
            Some(ms) => eprintln!("[tool {} {}: {status} in {ms}ms]", call.tool_name, call.id),
            None => eprintln!("[tool {} {}: {status}]", call.tool_name, call.id),
        }
    }
}

/// Writes the part of the assistant reply not yet printed.
#[derive(Default)]
struct DeltaPrinter {
    message_id: Option<String>,
    printed: usize,
}

impl DeltaPrinter {
    fn show(&mut self, snap: &ChatSnapshot) {
        let Some(msg) = snap.last_message().filter(|m| m.role == Role::Assistant) else {
            return;
        };
        if self.message_id.as_deref() != Some(msg.id.as_str()) {
            self.message_id = Some(msg.id.clone());
            self.printed = 0;
        }
        if let Some(fresh) = msg.content.get(self.printed..)
            && !fresh.is_empty()
        {
            print!("{fresh}");
            io::stdout().flush().ok();
            self.printed = msg.content.len();
        }
    }
}

async fn run_turn(session: &ChatSession, message: &str) -> anyhow::Result<TurnOutcome> {
    let mut rx = session.subscribe();
    let mut printer = DeltaPrinter::default();
    let send = session.send_message(message);
    tokio::pin!(send);

    let outcome = loop {
        tokio::select! {
            res = &mut send => break res?,
            changed = rx.changed() => {
                if changed.is_ok() {
                    let snap = rx.borrow_and_update().clone();
                    printer.show(&snap);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if session.cancel() {
                    eprintln!("\n[cancelled]");
                }
            }
        }
    };
    if outcome != TurnOutcome::Cancelled {
        printer.show(&session.snapshot());
    }
    if printer.printed > 0 {
        println!();
    }
    Ok(outcome)
}

fn report(outcome: &TurnOutcome, snap: &ChatSnapshot) {
    match outcome {
        TurnOutcome::Completed { usage: Some(u) } => eprintln!(
            "[done: {} in / {} out tokens, ${:.4}]",
            u.input_tokens, u.output_tokens, u.cost_usd
        ),
        TurnOutcome::Completed { usage: None } => eprintln!("[done]"),
        TurnOutcome::Failed { message } => eprintln!("[error: {message}]"),
        TurnOutcome::Interrupted => eprintln!("[stream ended before done]"),
        TurnOutcome::Ignored => eprintln!("[nothing sent]"),
        TurnOutcome::Cancelled => {}
    }
    if let Some(conv) = &snap.conversation_id {
        tracing::debug!(conversation_id = %conv, version = snap.version, "session state");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            config,
            agent,
            workspace,
            conversation,
            message,
        } => {
            let cfg = Config::from_path(&config)
                .with_context(|| format!("loading config {}", config.display()))?;
            let agent = agent
                .or_else(|| cfg.chat.agent_id.clone())
                .ok_or_else(|| anyhow!("no agent id: pass --agent or set chat.agent_id"))?;
            let workspace = workspace
                .or_else(|| cfg.chat.workspace_id.clone())
                .ok_or_else(|| anyhow!("no workspace id: pass --workspace or set chat.workspace_id"))?;
            let transport: Arc<dyn ChatTransport> = Arc::new(HttpTransport::from_config(&cfg)?);

            let session = ChatSession::builder(transport)
                .agent(agent)
                .workspace(workspace)
                .conversation(conversation)
                .observer(Arc::new(CliObserver))
                .telemetry(Arc::new(TracingSink))
                .build()?;

            let outcome = run_turn(&session, &message).await?;
            report(&outcome, &session.snapshot());
        }
        Commands::Replay {
            file,
            chunk_size,
            message,
        } => {
            let transport = ReplayTransport::from_path(&file)
                .with_context(|| format!("reading {}", file.display()))?
                .chunk_size(chunk_size);
            let session = ChatSession::builder(Arc::new(transport))
                .agent("replay")
                .workspace("replay")
                .observer(Arc::new(CliObserver))
                .build()?;

            let outcome = session.send_message(&message).await?;
            let snap = session.snapshot();
            report(&outcome, &snap);
            println!("{}", serde_json::to_string_pretty(&snap)?);
        }
    }

    Ok(())
}
