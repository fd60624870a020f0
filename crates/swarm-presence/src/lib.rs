//! Peer liveness: heartbeat publication and missed-beat failure detection.
//!
//! Every sidecar broadcasts a heartbeat on a fixed interval and passively
//! tracks the heartbeats of its peers. A peer degrades
//! `online → suspect → offline` as consecutive missed intervals accumulate;
//! entering `offline` emits exactly one alert envelope per unbroken miss
//! streak. Peers are never deleted on failure — they stay queryable as
//! `offline` — but a capacity cap evicts the stalest records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use swarm_bus::Publisher;
use swarm_protocol::{BROADCAST, Channel, Envelope, SwarmResult, Urgency, topic};
use tracing::{debug, info, instrument, warn};

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Liveness payload carried in a heartbeat envelope's text field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vitals {
    pub node_id: String,
    pub uptime_s: f64,
    pub load_1m: f64,
    #[serde(default)]
    pub instances: Vec<InstanceStatus>,
}

/// Declared status of one locally supervised agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub name: String,
    pub status: String,
}

/// Peer liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Online,
    Suspect,
    Offline,
}

/// Tracked record for one peer node.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub node_id: String,
    /// Timestamp of the freshest heartbeat seen, per the envelope's `ts`.
    pub last_seen: u64,
    pub state: PeerState,
    pub misses: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vitals: Option<Vitals>,
    /// Alert latch: set when the offline alert for the current miss streak
    /// has been emitted, cleared by any fresh heartbeat.
    #[serde(skip)]
    alerted: bool,
}

/// Passive tracker over peer heartbeats with miss-based degradation.
///
/// Single-writer: the daemon loop observes heartbeats, the check tick
/// degrades states. Reads (snapshots) may happen concurrently.
pub struct PeerTracker {
    peers: Mutex<HashMap<String, PeerRecord>>,
    interval_secs: f64,
    miss_threshold: u32,
    capacity: usize,
}

impl PeerTracker {
    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn new(interval_secs: f64, miss_threshold: u32) -> Self {
        Self::with_capacity(interval_secs, miss_threshold, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(interval_secs: f64, miss_threshold: u32, capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            interval_secs: interval_secs.max(0.1),
            miss_threshold: miss_threshold.max(1),
            capacity: capacity.max(1),
        }
    }

    /// Record a heartbeat envelope from a peer.
    pub fn observe(&self, envelope: &Envelope) {
        self.observe_at(envelope, now_epoch());
    }

    /// Clock-injected variant of [`observe`](Self::observe).
    ///
    /// Heartbeats are interpreted by envelope timestamp: a duplicate or
    /// out-of-order beat older than the freshest one recorded is discarded.
    pub fn observe_at(&self, envelope: &Envelope, _now: u64) {
        let vitals = serde_json::from_str::<Vitals>(&envelope.text).ok();
        let mut peers = self.peers.lock();

        if let Some(record) = peers.get_mut(&envelope.from) {
            if envelope.ts < record.last_seen {
                debug!(peer = %envelope.from, ts = envelope.ts, "discarding stale heartbeat");
                return;
            }
            if record.state == PeerState::Offline {
                info!(peer = %envelope.from, "peer recovered");
            }
            record.last_seen = envelope.ts;
            record.state = PeerState::Online;
            record.misses = 0;
            record.alerted = false;
            if vitals.is_some() {
                record.vitals = vitals;
            }
            return;
        }

        if peers.len() >= self.capacity {
            Self::evict_one(&mut peers);
        }
        info!(peer = %envelope.from, "new peer discovered via heartbeat");
        peers.insert(
            envelope.from.clone(),
            PeerRecord {
                node_id: envelope.from.clone(),
                last_seen: envelope.ts,
                state: PeerState::Online,
                misses: 0,
                vitals,
                alerted: false,
            },
        );
    }

    /// Evict the stalest offline record, falling back to the stalest record
    /// overall when nothing is offline yet.
    fn evict_one(peers: &mut HashMap<String, PeerRecord>) {
        let victim = peers
            .values()
            .filter(|record| record.state == PeerState::Offline)
            .min_by_key(|record| record.last_seen)
            .or_else(|| peers.values().min_by_key(|record| record.last_seen))
            .map(|record| record.node_id.clone());
        if let Some(node_id) = victim {
            warn!(peer = %node_id, "evicting peer record at capacity");
            peers.remove(&node_id);
        }
    }

    /// Advance the failure detector to `now`.
    ///
    /// Returns the peers that entered `offline` on this tick and still owe
    /// an alert — exactly one per unbroken miss streak.
    pub fn tick_at(&self, now: u64) -> Vec<PeerRecord> {
        let mut newly_offline = Vec::new();
        let mut peers = self.peers.lock();

        for record in peers.values_mut() {
            let elapsed = now.saturating_sub(record.last_seen);
            let misses = (elapsed as f64 / self.interval_secs) as u32;
            record.misses = misses;

            if misses >= self.miss_threshold {
                if record.state != PeerState::Offline {
                    warn!(
                        peer = %record.node_id,
                        misses,
                        threshold = self.miss_threshold,
                        "peer offline"
                    );
                    record.state = PeerState::Offline;
                }
                if !record.alerted {
                    record.alerted = true;
                    newly_offline.push(record.clone());
                }
            } else if misses >= 1 && record.state == PeerState::Online {
                debug!(peer = %record.node_id, misses, "peer suspect");
                record.state = PeerState::Suspect;
            }
        }

        newly_offline
    }

    pub fn tick(&self) -> Vec<PeerRecord> {
        self.tick_at(now_epoch())
    }

    /// Snapshot of all tracked peers, sorted by node id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.peers.lock().values().cloned().collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    pub fn known_peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Publishes this node's own liveness and turns detector transitions into
/// alert envelopes on the bus.
pub struct HeartbeatManager {
    node_id: String,
    topic_prefix: String,
    escalation_target: String,
    tracker: Arc<PeerTracker>,
    publisher: Arc<dyn Publisher>,
    instances: Vec<String>,
    started: Instant,
}

impl HeartbeatManager {
    pub fn new(
        node_id: impl Into<String>,
        topic_prefix: impl Into<String>,
        escalation_target: impl Into<String>,
        tracker: Arc<PeerTracker>,
        publisher: Arc<dyn Publisher>,
        instances: Vec<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            topic_prefix: topic_prefix.into(),
            escalation_target: escalation_target.into(),
            tracker,
            publisher,
            instances,
            started: Instant::now(),
        }
    }

    pub fn tracker(&self) -> Arc<PeerTracker> {
        self.tracker.clone()
    }

    fn vitals(&self) -> Vitals {
        Vitals {
            node_id: self.node_id.clone(),
            uptime_s: self.started.elapsed().as_secs_f64(),
            load_1m: load_average_1m(),
            instances: self
                .instances
                .iter()
                .map(|name| InstanceStatus {
                    name: name.clone(),
                    status: "configured".to_owned(),
                })
                .collect(),
        }
    }

    /// Publish one heartbeat envelope to the broadcast heartbeat topic.
    #[instrument(skip(self))]
    pub async fn publish_heartbeat(&self) -> SwarmResult<()> {
        let text = serde_json::to_string(&self.vitals())?;
        let envelope = Envelope::new(
            &self.node_id,
            BROADCAST,
            Channel::Heartbeat,
            Urgency::Later,
            text,
        );
        let topic = topic::message(&self.topic_prefix, BROADCAST, Channel::Heartbeat);
        self.publisher
            .publish(&topic, envelope.to_json().into_bytes(), false)
            .await?;
        debug!(topic, "heartbeat published");
        Ok(())
    }

    /// Publish the retained per-node state snapshot.
    #[instrument(skip(self))]
    pub async fn publish_state(&self) -> SwarmResult<()> {
        let state = json!({
            "node_id": self.node_id,
            "status": "online",
            "last_seen": now_epoch(),
            "uptime_s": self.started.elapsed().as_secs_f64(),
            "known_peers": self.tracker.known_peer_ids(),
        });
        let topic = topic::state(&self.topic_prefix, &self.node_id);
        self.publisher
            .publish(&topic, serde_json::to_vec(&state)?, true)
            .await?;
        debug!(topic, "node state published");
        Ok(())
    }

    /// Publish the retained handler roster for this node.
    #[instrument(skip(self, handlers))]
    pub async fn publish_roster(&self, handlers: &[String]) -> SwarmResult<()> {
        let roster = json!({
            "node_id": self.node_id,
            "handlers": handlers,
        });
        let topic = topic::roster(&self.topic_prefix, &self.node_id);
        self.publisher
            .publish(&topic, serde_json::to_vec(&roster)?, true)
            .await?;
        info!(topic, count = handlers.len(), "roster published");
        Ok(())
    }

    /// Run the failure detector and emit one alert envelope per peer that
    /// entered offline on this tick.
    pub async fn check_peers(&self) -> SwarmResult<Vec<String>> {
        self.check_peers_at(now_epoch()).await
    }

    /// Clock-injected variant of [`check_peers`](Self::check_peers).
    pub async fn check_peers_at(&self, now: u64) -> SwarmResult<Vec<String>> {
        let mut alerted = Vec::new();
        for record in self.tracker.tick_at(now) {
            let text = format!(
                "peer {} missed heartbeats and is offline (last seen ts={})",
                record.node_id, record.last_seen
            );
            let envelope = Envelope::new(
                &self.node_id,
                &self.escalation_target,
                Channel::Alert,
                Urgency::Now,
                text,
            );
            let topic = topic::message(
                &self.topic_prefix,
                &self.escalation_target,
                Channel::Alert,
            );
            self.publisher
                .publish(&topic, envelope.to_json().into_bytes(), false)
                .await?;
            alerted.push(record.node_id);
        }
        Ok(alerted)
    }
}

/// 1-minute load average, best effort. Zero where unavailable.
#[cfg(target_os = "linux")]
fn load_average_1m() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|raw| raw.split_whitespace().next().map(str::to_owned))
        .and_then(|first| first.parse().ok())
        .unwrap_or(0.0)
}

#[cfg(not(target_os = "linux"))]
fn load_average_1m() -> f64 {
    0.0
}
