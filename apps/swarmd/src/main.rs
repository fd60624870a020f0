//! Swarm coordination sidecar.
//!
//! One long-lived process per host: drains the bus subscription stream into
//! the router, publishes heartbeats and retained node metadata on a timer,
//! and hands judgment calls to the local reasoning process through the
//! bridge. Reconnects to the broker indefinitely with bounded backoff;
//! SIGHUP rescans the handler directory.

mod bridge;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use swarm_bus::{BusClient, BusOptions, Publisher, next_message, reconnect_delay};
use swarm_config::{SwarmConfig, default_config_path, load_config};
use swarm_dispatch::{Dispatcher, SubprocessRunner};
use swarm_presence::{HeartbeatManager, PeerTracker};
use swarm_protocol::{Envelope, topic};
use swarm_router::{AgentBridge, Router};
use swarm_state::{CorrelationStore, SessionMap};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bridge::{LogBridge, SubprocessBridge};

#[derive(Debug, Parser)]
#[command(name = "swarmd")]
#[command(about = "Swarm coordination sidecar daemon")]
struct Cli {
    /// Config file path. Defaults to ~/.config/swarm/swarm.toml.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    init_tracing(&config.logging.level);
    info!(config = %config_path.display(), node = %config.node.id, "swarmd starting");

    run(config).await
}

async fn run(config: SwarmConfig) -> Result<()> {
    let node_id = config.node.id.clone();
    let prefix = config.node.topic_prefix.clone();

    let dispatcher = Arc::new(Dispatcher::new(
        &config.node.handler_dir,
        Duration::from_secs(config.node.handler_timeout),
        Arc::new(SubprocessRunner),
    ));
    let count = dispatcher.rescan();
    info!(count, dir = %config.node.handler_dir.display(), "handlers discovered");

    let options = BusOptions {
        client_id: format!("swarmd-{node_id}"),
        host: config.broker.host.clone(),
        port: config.broker.port,
        username: config.broker.username.clone(),
        password: config.broker.password.clone(),
        keepalive: Duration::from_secs(config.broker.keepalive),
    };
    let (client, mut event_loop) = BusClient::connect(&options);
    let publisher: Arc<dyn Publisher> = Arc::new(client.clone());

    let agent_bridge: Arc<dyn AgentBridge> = match &config.bridge {
        Some(bridge_config) => {
            info!(command = %bridge_config.command, "agent bridge configured");
            Arc::new(SubprocessBridge::new(bridge_config))
        }
        None => {
            warn!("no agent bridge configured, escalations will only be logged");
            Arc::new(LogBridge)
        }
    };

    let tracker = Arc::new(PeerTracker::new(
        config.heartbeat.interval,
        config.heartbeat.miss_threshold,
    ));
    let correlation = Arc::new(CorrelationStore::new(config.correlation.ttl));
    let sessions = Arc::new(SessionMap::from_env());
    info!(path = %sessions.path().display(), "session map location");

    let manager = Arc::new(HeartbeatManager::new(
        &node_id,
        &prefix,
        &config.heartbeat.escalation_target,
        tracker.clone(),
        publisher.clone(),
        config.node.instances.clone(),
    ));

    let router = Arc::new(Router::new(
        &node_id,
        &prefix,
        config.node.alert_on_failure,
        dispatcher.clone(),
        tracker,
        correlation.clone(),
        sessions,
        publisher.clone(),
        agent_bridge,
    ));

    let filters = topic::node_subscriptions(&prefix, &node_id);
    for filter in &filters {
        client
            .subscribe(filter)
            .await
            .with_context(|| format!("subscribing to {filter}"))?;
    }
    manager.publish_roster(&dispatcher.handler_names()).await?;
    manager.publish_state().await?;

    let tick_manager = manager.clone();
    let tick_correlation = correlation.clone();
    let tick_interval = Duration::from_secs_f64(config.heartbeat.interval.max(0.1));
    let tick_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = tick_manager.publish_heartbeat().await {
                warn!(%err, "heartbeat publish failed");
            }
            if let Err(err) = tick_manager.publish_state().await {
                warn!(%err, "state publish failed");
            }
            match tick_manager.check_peers().await {
                Ok(offline) if !offline.is_empty() => {
                    warn!(?offline, "peers went offline");
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "peer check failed"),
            }
            tick_correlation.sweep();
        }
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut reconnect_attempt: u32 = 0;

    loop {
        tokio::select! {
            message = next_message(&mut event_loop) => match message {
                Ok(Some(message)) => {
                    reconnect_attempt = 0;
                    if topic::channel_of(&prefix, &message.topic).is_none() {
                        debug!(topic = %message.topic, "ignoring non-channel topic");
                        continue;
                    }
                    let envelope = match Envelope::from_slice(&message.payload) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            warn!(%err, topic = %message.topic, "dropping malformed payload");
                            continue;
                        }
                    };
                    if Router::needs_dispatch(&envelope) {
                        // A slow handler must not stall message intake.
                        let router = router.clone();
                        tokio::spawn(async move {
                            if let Err(err) = router.route(envelope).await {
                                error!(%err, "routing failed");
                            }
                        });
                    } else if let Err(err) = router.route(envelope).await {
                        error!(%err, "routing failed");
                    }
                }
                Ok(None) => {
                    reconnect_attempt = 0;
                }
                Err(err) => {
                    let delay = reconnect_delay(reconnect_attempt);
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    error!(%err, attempt = reconnect_attempt, ?delay, "broker connection lost, backing off");
                    tokio::time::sleep(delay).await;
                    // Re-queue subscriptions; they flush once the session is back.
                    for filter in &filters {
                        if let Err(err) = client.subscribe(filter).await {
                            warn!(%err, %filter, "resubscribe failed");
                        }
                    }
                }
            },
            _ = sighup.recv() => {
                let count = dispatcher.rescan();
                info!(count, "handlers rescanned on SIGHUP");
                if let Err(err) = manager.publish_roster(&dispatcher.handler_names()).await {
                    warn!(%err, "roster publish failed");
                }
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    tick_task.abort();
    let offline = json!({
        "node_id": node_id,
        "status": "offline",
        "last_seen": now_epoch(),
    });
    if let Err(err) = publisher
        .publish(
            &topic::state(&prefix, &node_id),
            serde_json::to_vec(&offline)?,
            true,
        )
        .await
    {
        warn!(%err, "offline state publish failed");
    }
    // Let the event loop flush the final publish before disconnecting.
    for _ in 0..8 {
        if next_message(&mut event_loop).await.is_err() {
            break;
        }
    }
    let _ = client.disconnect().await;
    info!("swarmd stopped");
    Ok(())
}
