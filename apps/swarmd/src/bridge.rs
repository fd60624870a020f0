//! Bridges routed envelopes into the local reasoning process.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use swarm_config::BridgeConfig;
use swarm_protocol::SwarmResult;
use swarm_router::{AgentBridge, Delivery};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Render a delivery as the text handed to the agent: a routing header, the
/// enrichment or escalation note, the message body, and the raw envelope as
/// a machine-readable trailer.
fn format_message(delivery: &Delivery) -> String {
    let envelope = &delivery.envelope;
    let mut out = format!(
        "[swarm from={} ch={} urgency={}]\n",
        envelope.from, envelope.ch, delivery.priority
    );
    if let Some(note) = &delivery.note {
        out.push_str(note);
        out.push('\n');
    }
    out.push_str(&envelope.text);
    out.push('\n');
    out.push_str("ENVELOPE_JSON: ");
    out.push_str(&envelope.to_json());
    out.push('\n');
    out
}

/// Hands each delivery to a configured command as a subprocess, message on
/// stdin, target conversation as the final argument.
///
/// Delivery is fire-and-forget: the agent may think for minutes, and the
/// routing loop must not wait on it. Failures are logged, not propagated —
/// a broken bridge must not take the daemon down.
pub struct SubprocessBridge {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    default_session: String,
}

impl SubprocessBridge {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout.max(1)),
            default_session: config.default_session.clone(),
        }
    }
}

#[async_trait]
impl AgentBridge for SubprocessBridge {
    async fn deliver(&self, delivery: Delivery) -> SwarmResult<()> {
        let session = delivery
            .session
            .clone()
            .unwrap_or_else(|| self.default_session.clone());
        let message = format_message(&delivery);
        let command = self.command.clone();
        let args = self.args.clone();
        let timeout = self.timeout;
        let id = delivery.envelope.id.clone();

        tokio::spawn(async move {
            let spawned = Command::new(&command)
                .args(&args)
                .arg(&session)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();
            let mut child = match spawned {
                Ok(child) => child,
                Err(err) => {
                    error!(%err, command, "bridge command failed to spawn");
                    return;
                }
            };
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(message.as_bytes()).await;
            }
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) if status.success() => {
                    info!(id, session, "delivered to agent");
                }
                Ok(Ok(status)) => {
                    warn!(id, session, ?status, "bridge command exited non-zero");
                }
                Ok(Err(err)) => {
                    error!(id, %err, "bridge command failed");
                }
                Err(_) => {
                    warn!(id, session, "bridge command timed out, killed");
                }
            }
        });
        Ok(())
    }
}

/// Fallback when no bridge is configured: escalations are visible in the
/// daemon log and nowhere else.
pub struct LogBridge;

#[async_trait]
impl AgentBridge for LogBridge {
    async fn deliver(&self, delivery: Delivery) -> SwarmResult<()> {
        info!(
            id = %delivery.envelope.id,
            from = %delivery.envelope.from,
            ch = %delivery.envelope.ch,
            priority = %delivery.priority,
            session = delivery.session.as_deref().unwrap_or("default"),
            note = delivery.note.as_deref().unwrap_or(""),
            text = %delivery.envelope.text,
            "no bridge configured, delivery logged"
        );
        Ok(())
    }
}
