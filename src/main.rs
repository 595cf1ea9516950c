//! # pulse
//!
//! Command-line front end: watch a session's live agent activity, ask an
//! agent for work while narrating what it does, or run the dev relay.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_agents::{
    AgentInvoker, AgentKind, HttpAgentClient, InvokeOutcome, InvokeRequest, RecentOutputs,
};
use pulse_core::ids::SessionId;
use pulse_core::settings::{load_settings, PulseSettings, StreamSettings};
use pulse_relay::RelayConfig;
use pulse_stream::{
    ActivityState, ActivityStreamClient, ActivityWatch, StreamConfig, WebSocketTransport,
};
use pulse_telemetry::{init_telemetry, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "pulse", about = "Live agent activity client")]
struct Cli {
    /// Log level (overrides settings; RUST_LOG wins over both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a session's activity stream.
    Watch {
        #[arg(long)]
        session: Option<String>,
        /// Stream endpoint (overrides settings).
        #[arg(long)]
        url: Option<String>,
    },
    /// Ask an agent for work and narrate its activity until it answers.
    Invoke {
        #[arg(long)]
        agent: String,
        message: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Interactive session with an agent; keeps recent outputs.
    Chat {
        #[arg(long, default_value = "content-writer")]
        agent: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// List the agents on the roster.
    Agents,
    /// Run the development relay.
    Relay {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print a fresh session id.
    Session,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings().context("failed to load settings")?;
    if let Some(level) = cli.log_level.clone() {
        settings.logging.level = level;
    }
    let _telemetry = init_telemetry(TelemetryConfig::from(&settings.logging));

    match cli.command {
        Command::Watch { session, url } => run_watch(&settings, session, url).await,
        Command::Invoke {
            agent,
            message,
            session,
        } => run_invoke(&settings, &agent, message, session).await,
        Command::Chat { agent, session } => run_chat(&settings, &agent, session).await,
        Command::Agents => {
            for kind in AgentKind::ALL {
                println!("{:<18} {:<18} {}", kind.id(), kind.display_name(), kind.description());
            }
            Ok(())
        }
        Command::Relay { port } => run_relay(&settings, port).await,
        Command::Session => {
            println!("{}", SessionId::new());
            Ok(())
        }
    }
}

fn session_or_new(session: Option<String>) -> SessionId {
    session
        .filter(|s| !s.is_empty())
        .map(SessionId::from_raw)
        .unwrap_or_default()
}

fn stream_client(
    settings: &StreamSettings,
    url: Option<String>,
) -> ActivityStreamClient<WebSocketTransport> {
    let endpoint = url.unwrap_or_else(|| settings.endpoint.clone());
    ActivityStreamClient::new(
        Arc::new(WebSocketTransport::new(endpoint)),
        StreamConfig::from(settings),
    )
}

/// One line per accepted transition.
fn status_line(state: &ActivityState) -> String {
    let connection = if state.is_connected() { "connected" } else { "disconnected" };
    if !state.is_processing() {
        return format!("[{connection}] idle ({} events)", state.events().len());
    }
    let agent = state
        .active_agent_name()
        .map(str::to_string)
        .or_else(|| state.active_agent_id().map(|id| id.to_string()))
        .unwrap_or_default();
    match state.last_thinking_message() {
        Some(thinking) => format!("[{connection}] {agent}: {thinking}"),
        None => format!("[{connection}] {agent} is working"),
    }
}

async fn print_transitions(mut watch: ActivityWatch) {
    while watch.changed().await {
        println!("{}", status_line(&watch.snapshot()));
    }
}

fn print_outcome(outcome: &InvokeOutcome) {
    match outcome.result_text() {
        Some(text) => println!("{text}"),
        None => println!("(no result)"),
    }
    for artifact in outcome.artifacts() {
        let name = artifact.name.as_deref().unwrap_or("artifact");
        let location = artifact.url.as_deref().or(artifact.path.as_deref()).unwrap_or("");
        println!("  artifact: {name} {location}");
    }
}

async fn run_watch(
    settings: &PulseSettings,
    session: Option<String>,
    url: Option<String>,
) -> Result<()> {
    let session_id = session_or_new(session);
    println!("watching session {session_id}");

    let mut client = stream_client(&settings.stream, url);
    let watch = client.subscribe(Some(session_id))?;
    let printer = tokio::spawn(print_transitions(watch));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    client.unsubscribe();
    printer.abort();
    Ok(())
}

async fn run_invoke(
    settings: &PulseSettings,
    agent: &str,
    message: String,
    session: Option<String>,
) -> Result<()> {
    let kind: AgentKind = agent.parse()?;
    let session_id = session_or_new(session);
    let invoker = HttpAgentClient::from_settings(&settings.agents)?;

    let mut client = stream_client(&settings.stream, None);
    let printer = tokio::spawn(print_transitions(client.subscribe(Some(session_id.clone()))?));

    let request = InvokeRequest::new(kind.agent_id(), message).in_session(session_id);
    let result = invoker.invoke(&request).await;
    client.unsubscribe();
    printer.abort();

    print_outcome(&result?);
    Ok(())
}

/// A line typed into `pulse chat`.
#[derive(Debug, PartialEq, Eq)]
enum ChatLine<'a> {
    Empty,
    Quit,
    Recent,
    SwitchAgent(&'a str),
    Message(&'a str),
}

fn parse_chat_line(line: &str) -> ChatLine<'_> {
    let line = line.trim();
    match line {
        "" => ChatLine::Empty,
        ":q" | ":quit" => ChatLine::Quit,
        ":recent" => ChatLine::Recent,
        _ => match line.strip_prefix(":agent ") {
            Some(agent) => ChatLine::SwitchAgent(agent.trim()),
            None => ChatLine::Message(line),
        },
    }
}

async fn run_chat(settings: &PulseSettings, agent: &str, session: Option<String>) -> Result<()> {
    let mut kind: AgentKind = agent.parse()?;
    let session_id = session_or_new(session);
    let invoker = HttpAgentClient::from_settings(&settings.agents)?;
    let mut recent = RecentOutputs::new(settings.agents.recent_outputs);

    let mut client = stream_client(&settings.stream, None);
    let printer = tokio::spawn(print_transitions(client.subscribe(Some(session_id.clone()))?));
    println!("session {session_id}, talking to {}", kind.display_name());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_chat_line(&line) {
            ChatLine::Empty => {}
            ChatLine::Quit => break,
            ChatLine::Recent => {
                for output in recent.iter() {
                    let preview: String = output.text.chars().take(60).collect();
                    println!(
                        "{} {} {}",
                        output.created_at.format("%H:%M:%S"),
                        output.agent_id,
                        preview
                    );
                }
            }
            ChatLine::SwitchAgent(id) => match id.parse::<AgentKind>() {
                Ok(next) => {
                    kind = next;
                    println!("now talking to {}", kind.display_name());
                }
                Err(err) => eprintln!("{err}"),
            },
            ChatLine::Message(message) => {
                let request =
                    InvokeRequest::new(kind.agent_id(), message).in_session(session_id.clone());
                match invoker.invoke(&request).await {
                    Ok(outcome) => {
                        print_outcome(&outcome);
                        recent.record(kind.agent_id(), message, &outcome);
                    }
                    Err(err) => eprintln!("{} failed: {err}", kind.display_name()),
                }
            }
        }
    }

    client.unsubscribe();
    printer.abort();
    Ok(())
}

async fn run_relay(settings: &PulseSettings, port: Option<u16>) -> Result<()> {
    let mut config = RelayConfig::from(&settings.relay);
    if let Some(port) = port {
        config.port = port;
    }
    let handle = pulse_relay::start(config).await?;
    println!("relay listening on {}", handle.activity_url());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down relay");
    handle.shutdown().await;
    Ok(())
}
