//! Client tool for the swarm bus.
//!
//! `send` and `reply` publish envelopes under this node's identity; `send
//! --wait` blocks for the correlated response. `status` and `roster` are
//! read-only queries against retained broker state. Exit status separates
//! "no response" (1) from "send failed" (2) so scripts can tell them apart.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swarm_bus::{
    BusClient, BusOptions, EventLoop, Publisher, collect_retained, flush_publish, next_message,
};
use swarm_config::{SwarmConfig, default_config_path, load_config};
use swarm_protocol::{Channel, Envelope, SwarmError, Urgency, topic};
use swarm_state::SessionMap;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const QUERY_WINDOW: Duration = Duration::from_secs(2);
const FLUSH_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "swarm")]
#[command(about = "Send, reply, and query on the swarm coordination bus")]
struct Cli {
    /// Config file path. Defaults to ~/.config/swarm/swarm.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish an envelope, optionally waiting for the correlated response.
    Send {
        /// Recipient node id, or "all" to broadcast.
        #[arg(long)]
        to: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "command")]
        ch: Channel,
        #[arg(long, default_value = "now")]
        urgency: Urgency,
        /// Action name for dispatch on the receiving node.
        #[arg(long)]
        action: Option<String>,
        /// Advisory time-to-live in seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// Correlation id; defaults to the message's own id.
        #[arg(long)]
        corr: Option<String>,
        /// Block up to this many seconds for the correlated response.
        #[arg(long)]
        wait: Option<u64>,
        /// Pin the correlation to a local conversation handle.
        #[arg(long)]
        session: Option<String>,
    },
    /// Build and publish a reply to a previously received envelope.
    Reply {
        /// Original envelope: inline JSON, @file, or "-" for stdin.
        #[arg(long = "to-msg")]
        to_msg: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "now")]
        urgency: Urgency,
        /// Pin the reply's correlation to a local conversation handle.
        #[arg(long)]
        session: Option<String>,
    },
    /// Show retained node state across the swarm.
    Status {
        /// Limit to one node.
        node: Option<String>,
    },
    /// Show retained handler rosters across the swarm.
    Roster {
        /// Limit to one node.
        node: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<SwarmError>() {
                Some(SwarmError::WaitTimeout(_)) => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;

    match cli.command {
        Command::Send {
            to,
            text,
            ch,
            urgency,
            action,
            ttl,
            corr,
            wait,
            session,
        } => {
            let mut envelope = Envelope::new(&config.node.id, &to, ch, urgency, text);
            envelope.action = action;
            envelope.ttl = ttl;
            envelope.corr = corr;
            envelope.validate()?;
            send(&config, envelope, wait, session).await
        }
        Command::Reply {
            to_msg,
            text,
            urgency,
            session,
        } => {
            let original = read_original(&to_msg).await?;
            let reply = original.reply(&config.node.id, text, urgency);
            send(&config, reply, None, session).await
        }
        Command::Status { node } => {
            query(&config, node.as_deref(), "state", print_status).await
        }
        Command::Roster { node } => {
            query(&config, node.as_deref(), "roster", print_roster).await
        }
    }
}

fn bus_options(config: &SwarmConfig) -> BusOptions {
    BusOptions {
        // Unique per invocation so a CLI run never evicts the daemon's session.
        client_id: format!("swarm-cli-{}-{}", config.node.id, uuid::Uuid::new_v4()),
        host: config.broker.host.clone(),
        port: config.broker.port,
        username: config.broker.username.clone(),
        password: config.broker.password.clone(),
        keepalive: Duration::from_secs(config.broker.keepalive),
    }
}

/// Publish one envelope, pinning its session first if requested, and wait
/// for the correlated response if asked.
async fn send(
    config: &SwarmConfig,
    envelope: Envelope,
    wait: Option<u64>,
    session: Option<String>,
) -> Result<()> {
    let prefix = &config.node.topic_prefix;
    let corr_key = envelope.corr_key().to_owned();

    // Pinning is local-only and never alters the published envelope. The
    // pin TTL falls back to the envelope's own ttl, then the map's default.
    if let Some(handle) = session {
        SessionMap::from_env()
            .pin(&corr_key, &handle, envelope.ttl)
            .await?;
        debug!(corr = %corr_key, session = %handle, "session pinned");
    }

    let options = bus_options(config);
    let (client, mut event_loop) = BusClient::connect(&options);

    // Subscribe to the response locations before publishing so the reply
    // cannot slip past between publish and subscribe.
    if wait.is_some() {
        client
            .subscribe(&topic::message(prefix, &config.node.id, Channel::Response))
            .await?;
        client
            .subscribe(&topic::message(prefix, swarm_protocol::BROADCAST, Channel::Response))
            .await?;
    }

    let publish_topic = topic::message(prefix, &envelope.to, envelope.ch);
    client
        .publish(&publish_topic, envelope.to_json().into_bytes(), false)
        .await?;
    flush_publish(&mut event_loop, FLUSH_WINDOW).await?;
    println!("{}", envelope.to_json());

    if let Some(wait_secs) = wait {
        let waited = wait_for_response(&mut event_loop, &corr_key, wait_secs).await;
        // Tear the session down before surfacing a timeout so no
        // subscription outlives this invocation.
        let _ = client.disconnect().await;
        println!("{}", waited?.to_json());
    } else {
        client.disconnect().await?;
    }
    Ok(())
}

/// Drain the event loop until a response bearing `corr` arrives or the
/// deadline passes.
async fn wait_for_response(
    event_loop: &mut EventLoop,
    corr: &str,
    wait_secs: u64,
) -> Result<Envelope> {
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SwarmError::WaitTimeout(wait_secs).into());
        }
        let polled = tokio::time::timeout(remaining, next_message(event_loop)).await;
        let message = match polled {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => continue,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(SwarmError::WaitTimeout(wait_secs).into()),
        };
        match Envelope::from_slice(&message.payload) {
            Ok(envelope)
                if envelope.ch == Channel::Response && envelope.corr.as_deref() == Some(corr) =>
            {
                return Ok(envelope);
            }
            Ok(envelope) => {
                debug!(id = %envelope.id, "unrelated message while waiting");
            }
            Err(err) => {
                debug!(%err, "ignoring malformed message while waiting");
            }
        }
    }
}

/// Read the original envelope for `reply`: inline JSON, `@path`, or stdin.
async fn read_original(source: &str) -> Result<Envelope> {
    let raw = if source == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("reading original envelope from stdin")?;
        buf
    } else if let Some(path) = source.strip_prefix('@') {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading original envelope from {path}"))?
    } else {
        source.to_owned()
    };
    Ok(Envelope::from_slice(raw.as_bytes())?)
}

/// Snapshot retained meta documents (`state` or `roster`) and print them.
async fn query(
    config: &SwarmConfig,
    node: Option<&str>,
    kind: &str,
    print: fn(&str, &serde_json::Value),
) -> Result<()> {
    let prefix = &config.node.topic_prefix;
    let filter = match (kind, node) {
        ("state", Some(node)) => topic::state(prefix, node),
        ("state", None) => topic::state_filter(prefix),
        (_, Some(node)) => topic::roster(prefix, node),
        (_, None) => topic::roster_filter(prefix),
    };

    let options = bus_options(config);
    let mut collected = collect_retained(&options, &[filter], QUERY_WINDOW).await?;
    collected.sort_by(|a, b| a.0.cmp(&b.0));

    if collected.is_empty() {
        println!("no retained {kind} documents found");
        return Ok(());
    }
    for (meta_topic, value) in &collected {
        let node = topic::meta_node(prefix, meta_topic).unwrap_or("?");
        print(node, value);
    }
    Ok(())
}

fn print_status(node: &str, value: &serde_json::Value) {
    let status = value["status"].as_str().unwrap_or("unknown");
    let last_seen = value["last_seen"].as_u64().unwrap_or(0);
    let uptime = value["uptime_s"].as_f64().unwrap_or(0.0);
    println!("{node:<20} {status:<8} last_seen={last_seen} uptime={uptime:.0}s");
}

fn print_roster(node: &str, value: &serde_json::Value) {
    let handlers: Vec<&str> = value["handlers"]
        .as_array()
        .map(|list| list.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    println!("{node:<20} {}", handlers.join(", "));
}
