//! Line-oriented console client for an agent server.
//!
//! Run with: cargo run -p console-example -- wss://agents.example.com/ws
//!
//! Plain lines are sent as input. Slash commands:
//! `/interrupt`, `/stop`, `/model NAME`, `/mode MODE`, `/allow ID`,
//! `/always ID`, `/deny ID`, `/answer ID QUESTION ANSWER`, `/retry ID`,
//! `/sessions`, `/bg`, `/fg`, `/offline`, `/online`, `/reconnect`,
//! `/status`, `/quit`.

use std::{collections::BTreeMap, path::PathBuf};

use agent_link_core::{
    CursorStore, EngineConfig, MessageId, PermissionChoice, PermissionMode, StreamEvent,
};
use agent_link_session::{
    EventStream, LifecycleBridge, LifecycleSignal, SessionEngine, storage::FileCursorStore,
};
use agent_link_transport::WsConnector;
use anyhow::{Context, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "agent-link", about = "Talk to a remote agent session")]
struct Args {
    /// Server endpoint (ws, wss, http or https URL).
    endpoint: String,

    /// Resume this session instead of starting a new one.
    #[arg(long)]
    session: Option<String>,

    /// Model to request.
    #[arg(long)]
    model: Option<String>,

    /// TOML engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for replay cursors. Defaults to the platform data dir.
    #[arg(long)]
    cursor_dir: Option<PathBuf>,
}

type Engine = SessionEngine<WsConnector, FileCursorStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let store = match args.cursor_dir {
        Some(dir) => FileCursorStore::new(dir),
        None => FileCursorStore::default_location().context("no data directory available")?,
    };
    tracing::debug!(dir = %store.dir().display(), "Cursor store");

    if let Some(session) = &args.session {
        if let Some(cursor) = store.load(session).await? {
            tracing::info!(%session, %cursor, "Resuming from stored cursor");
        }
    }

    let (engine, events) = SessionEngine::new(WsConnector::new(), store, config);
    tokio::spawn(print_events(events));

    engine
        .connect(&args.endpoint, args.session, args.model)
        .await
        .context("connecting")?;

    let bridge = LifecycleBridge::new(engine.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_line(&engine, &bridge, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("! {e:#}"),
        }
    }

    engine.disconnect(true).await;
    if let Some(session) = engine.session_id().await {
        println!("Session {session} kept. Resume with --session {session}");
    }
    Ok(())
}

/// Handle one input line. Returns `false` to quit.
async fn run_line(
    engine: &Engine,
    bridge: &LifecycleBridge<WsConnector, FileCursorStore>,
    line: &str,
) -> anyhow::Result<bool> {
    let Some(command) = line.strip_prefix('/') else {
        engine.send_input(line, Vec::new(), None).await?;
        return Ok(true);
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let rest: Vec<&str> = parts.collect();
    let arg = |i: usize| {
        rest.get(i)
            .copied()
            .with_context(|| format!("/{name} needs more arguments"))
    };

    match name {
        "quit" | "exit" => return Ok(false),
        "interrupt" => engine.interrupt().await?,
        "stop" => engine.stop().await?,
        "model" => engine.set_model(arg(0)?).await?,
        "mode" => engine.set_permission_mode(parse_mode(arg(0)?)?).await?,
        "allow" => {
            engine
                .respond_permission(arg(0)?, PermissionChoice::Allow)
                .await?;
        }
        "always" => {
            engine
                .respond_permission(arg(0)?, PermissionChoice::AllowAlways)
                .await?;
        }
        "deny" => {
            engine
                .respond_permission(arg(0)?, PermissionChoice::Deny)
                .await?;
        }
        "answer" => {
            let answer = rest.get(2..).map(|a| a.join(" ")).unwrap_or_default();
            let answers = BTreeMap::from([(arg(1)?.to_string(), answer)]);
            engine.respond_question(arg(0)?, answers).await?;
        }
        "retry" => engine.retry(MessageId::new(arg(0)?)).await?,
        "sessions" => engine.subscribe_sessions().await?,
        "bg" => bridge.handle(LifecycleSignal::Background).await,
        "fg" => bridge.handle(LifecycleSignal::Foreground).await,
        "offline" => bridge.handle(LifecycleSignal::NetworkLost).await,
        "online" => bridge.handle(LifecycleSignal::NetworkRestored).await,
        "reconnect" => {
            if !engine.reconnect_now().await {
                bail!("nothing to reconnect");
            }
        }
        "status" => {
            println!(
                "status={:?} session={:?} agent={:?} cursor={:?} pending={:?}",
                engine.status().await,
                engine.session_id().await,
                engine.agent_id().await,
                engine.cursor().await.map(|c| c.to_string()),
                engine.pending_permission_ids().await,
            );
        }
        other => bail!("unknown command /{other}"),
    }
    Ok(true)
}

fn parse_mode(s: &str) -> anyhow::Result<PermissionMode> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("unknown permission mode {s}"))
}

async fn print_events(mut events: EventStream) {
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::TextDelta { text, .. } => print!("{text}"),
            StreamEvent::Text { text, .. } => println!("{text}"),
            StreamEvent::Thinking { text, .. } => println!("(thinking) {text}"),
            StreamEvent::ToolStart {
                tool_name, input, ..
            } => println!("-> {tool_name} {input}"),
            StreamEvent::ToolResult {
                output, is_error, ..
            } => println!("<- {}{output}", if is_error { "error: " } else { "" }),
            StreamEvent::PermissionRequest {
                request_id,
                tool_name,
                input,
                ..
            } => println!("? {tool_name} {input}  (/allow {request_id} | /deny {request_id})"),
            StreamEvent::QuestionRequest {
                request_id,
                questions,
                ..
            } => {
                for q in questions {
                    println!("? {} {:?}  (/answer {request_id} {} ...)", q.prompt, q.options, q.id);
                }
            }
            StreamEvent::HistoryBatch { events, has_more } => {
                println!("[history: {} new, more={has_more}]", events.len());
            }
            StreamEvent::SessionList { sessions } => {
                for s in sessions {
                    println!(
                        "  {} {}",
                        s.session_id,
                        s.title.as_deref().unwrap_or("(untitled)")
                    );
                }
            }
            StreamEvent::Connected {
                session_id, model, ..
            } => println!("[connected to {session_id} model={model:?}]"),
            StreamEvent::StatusChanged { status } => tracing::debug!(?status, "Status"),
            StreamEvent::Reconnecting { attempt, delay_ms } => {
                println!("[reconnecting, attempt {attempt} in {delay_ms}ms]");
            }
            other => println!("[{}]", serde_json::to_string(&other).unwrap_or_default()),
        }
    }
}
