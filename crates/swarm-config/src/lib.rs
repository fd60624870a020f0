//! Configuration loading for the swarm daemon and CLI.
//!
//! Both binaries read the same TOML file so a node's identity, broker
//! coordinates, and topic prefix stay consistent between the long-lived
//! sidecar and the per-invocation client tool.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level swarm configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SwarmConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity and handler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Required: this node's identity on the bus.
    pub id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_handler_dir")]
    pub handler_dir: PathBuf,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout: u64,
    /// Emit an alert envelope back to the sender when a handler fails.
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    /// Names of locally supervised agent instances, reported in heartbeats.
    #[serde(default)]
    pub instances: Vec<String>,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: None,
            password: None,
            keepalive: default_keepalive(),
        }
    }
}

/// Heartbeat timing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval: f64,
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    /// Recipient of peer-offline alerts. Defaults to the broadcast sentinel.
    #[serde(default = "default_escalation_target")]
    pub escalation_target: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            miss_threshold: default_miss_threshold(),
            escalation_target: default_escalation_target(),
        }
    }
}

/// Correlation store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    /// Default entry lifetime in seconds when the envelope carries no ttl.
    #[serde(default = "default_correlation_ttl")]
    pub ttl: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            ttl: default_correlation_ttl(),
        }
    }
}

/// Local reasoning-process bridge: the command the daemon runs to hand a
/// message to the agent. Absent → escalations are logged only.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_bridge_timeout")]
    pub timeout: u64,
    #[serde(default = "default_session")]
    pub default_session: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_topic_prefix() -> String {
    "swarm".to_owned()
}

fn default_handler_dir() -> PathBuf {
    PathBuf::from("swarm.d")
}

fn default_handler_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_broker_host() -> String {
    "localhost".to_owned()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_heartbeat_interval() -> f64 {
    5.0
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_escalation_target() -> String {
    "all".to_owned()
}

fn default_correlation_ttl() -> u64 {
    3600
}

fn default_bridge_timeout() -> u64 {
    300
}

fn default_session() -> String {
    "default".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Default config location: `~/.config/swarm/swarm.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swarm")
        .join("swarm.toml")
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading config file {path:?}"))?;
    parse_config(&raw).with_context(|| format!("failed parsing config file {path:?}"))
}

/// Parse configuration from TOML text.
pub fn parse_config(raw: &str) -> Result<SwarmConfig> {
    let config: SwarmConfig = toml::from_str(raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_applies_defaults() {
        let config = parse_config("[node]\nid = \"alpha\"\n").unwrap();
        assert_eq!(config.node.id, "alpha");
        assert_eq!(config.node.topic_prefix, "swarm");
        assert_eq!(config.node.handler_timeout, 30);
        assert!(config.node.alert_on_failure);
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.heartbeat.interval, 5.0);
        assert_eq!(config.heartbeat.miss_threshold, 3);
        assert_eq!(config.heartbeat.escalation_target, "all");
        assert_eq!(config.correlation.ttl, 3600);
        assert!(config.bridge.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn full_config_roundtrip() {
        let raw = r#"
[node]
id = "gamma"
topic_prefix = "org/swarm"
handler_dir = "/etc/swarm/handlers"
handler_timeout = 10
alert_on_failure = false

[broker]
host = "broker.internal"
port = 8883
username = "swarm"
password = "secret"
keepalive = 30

[heartbeat]
interval = 2.5
miss_threshold = 5
escalation_target = "ops"

[correlation]
ttl = 600

[bridge]
command = "agentctl"
args = ["inject", "--quiet"]
timeout = 120
default_session = "main"

[logging]
level = "debug"
"#;
        let config = parse_config(raw).unwrap();
        assert_eq!(config.node.topic_prefix, "org/swarm");
        assert!(!config.node.alert_on_failure);
        assert_eq!(config.broker.username.as_deref(), Some("swarm"));
        assert_eq!(config.heartbeat.miss_threshold, 5);
        assert_eq!(config.heartbeat.escalation_target, "ops");
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.command, "agentctl");
        assert_eq!(bridge.args, vec!["inject", "--quiet"]);
        assert_eq!(bridge.default_session, "main");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn missing_node_id_is_an_error() {
        assert!(parse_config("[broker]\nhost = \"x\"\n").is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm.toml");
        std::fs::write(&path, "[node]\nid = \"delta\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.node.id, "delta");
    }

    #[test]
    fn load_config_missing_file_is_an_error() {
        assert!(load_config(Path::new("/nonexistent/swarm.toml")).is_err());
    }
}
