//! MQTT transport for the swarm bus.
//!
//! Wraps rumqttc behind a narrow [`Publisher`] seam so routing, dispatch,
//! and presence code never touch the broker client directly (and tests can
//! substitute a recording implementation). The broker is an external
//! dependency; this crate only connects, publishes, and drains inbound
//! publishes — retained semantics, QoS, and store-and-forward stay on the
//! broker side.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
pub use rumqttc::EventLoop;
use swarm_protocol::{SwarmError, SwarmResult};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Broker connection options.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Broker-visible client id. Must be unique per connection.
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
}

impl BusOptions {
    fn to_mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keepalive);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

/// One inbound publish drained from the event loop.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The single outbound capability the rest of the system depends on.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> SwarmResult<()>;
}

/// Live broker connection handle. Cheap to clone; all clones share one
/// underlying session.
#[derive(Clone)]
pub struct BusClient {
    client: AsyncClient,
}

impl BusClient {
    /// Open a connection. The returned [`EventLoop`] must be polled for the
    /// connection to make progress, including for publishes to flush.
    pub fn connect(options: &BusOptions) -> (Self, EventLoop) {
        let (client, event_loop) = AsyncClient::new(options.to_mqtt_options(), 64);
        (Self { client }, event_loop)
    }

    pub async fn subscribe(&self, topic: &str) -> SwarmResult<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|err| SwarmError::Transport(err.to_string()))
    }

    pub async fn disconnect(&self) -> SwarmResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|err| SwarmError::Transport(err.to_string()))
    }
}

#[async_trait]
impl Publisher for BusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> SwarmResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|err| SwarmError::Transport(err.to_string()))
    }
}

/// Poll the event loop once, mapping inbound publishes to [`BusMessage`].
///
/// `Ok(None)` is a non-publish protocol event (connack, suback, pings);
/// `Err` is a transport failure — the caller decides whether to back off and
/// keep polling (the daemon) or give up (the CLI).
pub async fn next_message(event_loop: &mut EventLoop) -> SwarmResult<Option<BusMessage>> {
    match event_loop.poll().await {
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            debug!(topic = %publish.topic, bytes = publish.payload.len(), "bus message received");
            Ok(Some(BusMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }))
        }
        Ok(_) => Ok(None),
        Err(err) => Err(SwarmError::Transport(err.to_string())),
    }
}

/// Bounded exponential backoff for reconnect attempts: 1s, 2s, 4s, ... capped
/// at 60s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs.min(60))
}

/// Poll the event loop until the broker acknowledges an outstanding QoS 1
/// publish, or `window` elapses.
///
/// A fire-and-forget client exits right after publishing; without draining
/// the acknowledgment the message may never leave the process.
pub async fn flush_publish(event_loop: &mut EventLoop, window: Duration) -> SwarmResult<()> {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SwarmError::Transport(
                "publish not acknowledged in time".to_owned(),
            ));
        }
        match tokio::time::timeout(remaining, event_loop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(SwarmError::Transport(err.to_string())),
            Err(_) => {
                return Err(SwarmError::Transport(
                    "publish not acknowledged in time".to_owned(),
                ));
            }
        }
    }
}

/// Subscribe to `filters` and collect retained publishes for `window`.
///
/// Used by the read-only status/roster queries: retained messages arrive
/// immediately after subscribing, so a short window is enough to take a
/// snapshot of broker-held cluster state.
pub async fn collect_retained(
    options: &BusOptions,
    filters: &[String],
    window: Duration,
) -> SwarmResult<Vec<(String, serde_json::Value)>> {
    let (client, mut event_loop) = BusClient::connect(options);
    for filter in filters {
        client.subscribe(filter).await?;
    }

    let deadline = Instant::now() + window;
    let mut collected = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, next_message(&mut event_loop)).await {
            Ok(Ok(Some(message))) => match serde_json::from_slice(&message.payload) {
                Ok(value) => collected.push((message.topic, value)),
                Err(err) => {
                    warn!(topic = %message.topic, %err, "skipping unparseable retained payload");
                }
            },
            Ok(Ok(None)) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => break,
        }
    }

    let _ = client.disconnect().await;
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_bounded() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(reconnect_delay(6), Duration::from_secs(60));
        assert_eq!(reconnect_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn credentials_only_set_when_both_present() {
        let mut options = BusOptions {
            client_id: "alpha".into(),
            host: "localhost".into(),
            port: 1883,
            username: Some("user".into()),
            password: None,
            keepalive: Duration::from_secs(60),
        };
        // Half-configured credentials are ignored rather than sent empty.
        let mqtt = options.to_mqtt_options();
        assert!(mqtt.credentials().is_none());

        options.password = Some("secret".into());
        let mqtt = options.to_mqtt_options();
        assert!(mqtt.credentials().is_some());
    }
}
