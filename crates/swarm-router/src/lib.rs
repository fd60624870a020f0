//! Channel routing for inbound envelopes.
//!
//! Given a validated envelope, the router decides its treatment by channel:
//! heartbeats feed the peer tracker, actionable commands and syncs go to the
//! dispatcher, responses are matched against the correlation store and
//! session map, and everything that needs a judgment call crosses the
//! [`AgentBridge`] seam to the local reasoning process. Every failure mode
//! is recovered here; nothing in the routing path may take the daemon down.

use std::sync::Arc;

use async_trait::async_trait;
use swarm_bus::Publisher;
use swarm_dispatch::Dispatcher;
use swarm_presence::PeerTracker;
use swarm_protocol::{Channel, Envelope, SwarmError, SwarmResult, Urgency, topic};
use swarm_state::{CorrelationStore, SessionMap};
use tracing::{debug, info, instrument, warn};

/// One envelope handed across the bridge to the local reasoning process.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Effective priority: the envelope's urgency, except alerts which are
    /// always immediate.
    pub priority: Urgency,
    /// Conversation to deliver into; `None` means the default context.
    pub session: Option<String>,
    /// Routing annotation prepended for the consumer: request context for an
    /// enriched response, or the reason for an escalation.
    pub note: Option<String>,
}

/// Seam to the local reasoning process. The daemon implements this as a
/// subprocess invocation; tests record what would have been delivered.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    async fn deliver(&self, delivery: Delivery) -> SwarmResult<()>;
}

/// Per-channel routing over the shared node state.
pub struct Router {
    node_id: String,
    topic_prefix: String,
    alert_on_failure: bool,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<PeerTracker>,
    correlation: Arc<CorrelationStore>,
    sessions: Arc<SessionMap>,
    publisher: Arc<dyn Publisher>,
    bridge: Arc<dyn AgentBridge>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        topic_prefix: impl Into<String>,
        alert_on_failure: bool,
        dispatcher: Arc<Dispatcher>,
        tracker: Arc<PeerTracker>,
        correlation: Arc<CorrelationStore>,
        sessions: Arc<SessionMap>,
        publisher: Arc<dyn Publisher>,
        bridge: Arc<dyn AgentBridge>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            topic_prefix: topic_prefix.into(),
            alert_on_failure,
            dispatcher,
            tracker,
            correlation,
            sessions,
            publisher,
            bridge,
        }
    }

    /// Whether routing this envelope may run a handler subprocess.
    ///
    /// The daemon offloads these to a task so a slow handler never stalls
    /// message intake; everything else routes inline in receipt order.
    pub fn needs_dispatch(envelope: &Envelope) -> bool {
        envelope.action.is_some() && matches!(envelope.ch, Channel::Command | Channel::Sync)
    }

    /// Route one validated envelope per its channel.
    #[instrument(skip(self, envelope), fields(id = %envelope.id, ch = %envelope.ch, from = %envelope.from))]
    pub async fn route(&self, envelope: Envelope) -> SwarmResult<()> {
        // Self-observation: we subscribe to the command wildcard so our own
        // outbound commands come back to us. Record them for later reply
        // enrichment and stop there.
        if envelope.from == self.node_id {
            if envelope.ch == Channel::Command {
                self.correlation.record(&envelope);
            }
            return Ok(());
        }

        if !envelope.addressed_to(&self.node_id) && envelope.ch != Channel::Command {
            debug!(to = %envelope.to, "not addressed to this node, dropping");
            return Ok(());
        }

        match envelope.ch {
            Channel::Heartbeat => {
                self.tracker.observe(&envelope);
                Ok(())
            }
            Channel::Command if !envelope.addressed_to(&self.node_id) => {
                // Another node's command, seen via the command wildcard.
                Ok(())
            }
            Channel::Command | Channel::Sync => {
                if envelope.action.is_some() {
                    self.run_action(envelope).await
                } else {
                    // Nothing to automate, so a judgment call substitutes.
                    let priority = envelope.urgency;
                    self.forward(envelope, priority, None).await
                }
            }
            Channel::Response => self.handle_response(envelope).await,
            Channel::Status => {
                info!(text = %envelope.text, "status from peer");
                if envelope.urgency == Urgency::Now {
                    self.forward(envelope, Urgency::Now, None).await
                } else {
                    Ok(())
                }
            }
            Channel::Alert => {
                // Urgency is advisory everywhere except here.
                self.forward(envelope, Urgency::Now, None).await
            }
        }
    }

    /// Dispatch an actionable envelope and publish its outcome.
    async fn run_action(&self, envelope: Envelope) -> SwarmResult<()> {
        let report = match self.dispatcher.dispatch(&envelope).await {
            Ok(report) => report,
            Err(SwarmError::HandlerNotFound(action)) => {
                // Escalation: a judgment call substitutes for automation.
                info!(action, "no handler registered, escalating");
                let note = format!("no handler registered for action {action:?}");
                let priority = envelope.urgency;
                return self.forward(envelope, priority, Some(note)).await;
            }
            Err(err) => return Err(err),
        };

        let result_topic =
            topic::action_result(&self.topic_prefix, &self.node_id, &report.action);
        let payload = report.to_payload(&self.node_id, &envelope.id);
        self.publisher
            .publish(&result_topic, serde_json::to_vec(&payload)?, true)
            .await?;

        // A command owes the sender a response envelope either way; a sync
        // only publishes the retained result.
        if envelope.ch == Channel::Command {
            let text = serde_json::to_string(&payload)?;
            let reply = envelope.reply(&self.node_id, text, Urgency::Now);
            let reply_topic = topic::message(&self.topic_prefix, &reply.to, reply.ch);
            self.publisher
                .publish(&reply_topic, reply.to_json().into_bytes(), false)
                .await?;
        }

        if !report.ok() {
            let failure = report.to_error(self.dispatcher.timeout_secs());
            if let Some(err) = &failure {
                warn!(%err, "dispatch failed");
            }
            // A failed background sync escalates so a judgment call can
            // pick up where automation gave out.
            if envelope.ch == Channel::Sync {
                let note = failure
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| format!("handler {:?} failed", report.action));
                let priority = envelope.urgency;
                return self.forward(envelope, priority, Some(note)).await;
            }
            if self.alert_on_failure {
                let alert = Envelope::new(
                    &self.node_id,
                    &envelope.from,
                    Channel::Alert,
                    Urgency::Now,
                    format!("handler {:?} failed on {}", report.action, self.node_id),
                );
                let alert_topic = topic::message(&self.topic_prefix, &alert.to, alert.ch);
                self.publisher
                    .publish(&alert_topic, alert.to_json().into_bytes(), false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Deliver a response to whoever is waiting for it.
    ///
    /// The session map picks the target conversation; the correlation store
    /// supplies request context for enrichment. A miss on either is not an
    /// error. A response with no correlation id at all has no addressee and
    /// is dropped.
    async fn handle_response(&self, envelope: Envelope) -> SwarmResult<()> {
        let Some(corr) = envelope.corr.clone() else {
            warn!(id = %envelope.id, "response without correlation id, dropping");
            return Ok(());
        };

        let session = self.sessions.resolve(&corr).await;
        let note = self
            .correlation
            .lookup(&corr)
            .map(|entry| format!("in reply to: {}", entry.text));
        if note.is_none() {
            debug!(corr, "no live correlation entry, delivering unenriched");
        }

        let priority = envelope.urgency;
        self.forward_with_session(envelope, priority, session, note)
            .await
    }

    async fn forward(
        &self,
        envelope: Envelope,
        priority: Urgency,
        note: Option<String>,
    ) -> SwarmResult<()> {
        self.forward_with_session(envelope, priority, None, note)
            .await
    }

    async fn forward_with_session(
        &self,
        envelope: Envelope,
        priority: Urgency,
        session: Option<String>,
        note: Option<String>,
    ) -> SwarmResult<()> {
        self.bridge
            .deliver(Delivery {
                envelope,
                priority,
                session,
                note,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use swarm_dispatch::SubprocessRunner;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>, bool)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> SwarmResult<()> {
            self.published
                .lock()
                .push((topic.to_owned(), payload, retain));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBridge {
        deliveries: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl AgentBridge for RecordingBridge {
        async fn deliver(&self, delivery: Delivery) -> SwarmResult<()> {
            self.deliveries.lock().push(delivery);
            Ok(())
        }
    }

    struct Fixture {
        router: Router,
        publisher: Arc<RecordingPublisher>,
        bridge: Arc<RecordingBridge>,
        tracker: Arc<PeerTracker>,
        correlation: Arc<CorrelationStore>,
        sessions: Arc<SessionMap>,
        _handler_dir: TempDir,
        _state_dir: TempDir,
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fixture(alert_on_failure: bool) -> Fixture {
        let handler_dir = TempDir::new().unwrap();
        write_script(handler_dir.path(), "disk-check", r#"echo '{"free_gb":42}'"#);
        write_script(handler_dir.path(), "broken", "echo boom >&2; exit 3");
        let dispatcher = Arc::new(Dispatcher::new(
            handler_dir.path(),
            Duration::from_secs(5),
            Arc::new(SubprocessRunner),
        ));
        dispatcher.rescan();

        let state_dir = TempDir::new().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let bridge = Arc::new(RecordingBridge::default());
        let tracker = Arc::new(PeerTracker::new(5.0, 3));
        let correlation = Arc::new(CorrelationStore::new(3600));
        let sessions = Arc::new(SessionMap::new(state_dir.path().join("session-map.json")));

        let router = Router::new(
            "beta",
            "swarm",
            alert_on_failure,
            dispatcher,
            tracker.clone(),
            correlation.clone(),
            sessions.clone(),
            publisher.clone(),
            bridge.clone(),
        );

        Fixture {
            router,
            publisher,
            bridge,
            tracker,
            correlation,
            sessions,
            _handler_dir: handler_dir,
            _state_dir: state_dir,
        }
    }

    fn envelope(from: &str, to: &str, ch: Channel, urgency: Urgency, text: &str) -> Envelope {
        Envelope::new(from, to, ch, urgency, text)
    }

    #[test]
    fn only_actionable_command_and_sync_need_dispatch() {
        let with_action = envelope("alpha", "beta", Channel::Command, Urgency::Now, "go")
            .with_action("disk-check");
        assert!(Router::needs_dispatch(&with_action));

        let sync = envelope("alpha", "all", Channel::Sync, Urgency::Later, "refresh")
            .with_action("disk-check");
        assert!(Router::needs_dispatch(&sync));

        let plain = envelope("alpha", "beta", Channel::Command, Urgency::Now, "think");
        assert!(!Router::needs_dispatch(&plain));
        let response = envelope("alpha", "beta", Channel::Response, Urgency::Now, "done")
            .with_corr("k1");
        assert!(!Router::needs_dispatch(&response));
    }

    #[tokio::test]
    async fn not_addressed_is_never_routed() {
        let fx = fixture(false);
        let env = envelope("alpha", "gamma", Channel::Alert, Urgency::Now, "fire");
        fx.router.route(env).await.unwrap();
        assert!(fx.bridge.deliveries.lock().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_feeds_tracker_and_never_reaches_bridge() {
        let fx = fixture(false);
        let env = envelope("alpha", "all", Channel::Heartbeat, Urgency::Later, "{}");
        fx.router.route(env).await.unwrap();
        assert_eq!(fx.tracker.known_peer_ids(), vec!["alpha"]);
        assert!(fx.bridge.deliveries.lock().is_empty());
    }

    #[tokio::test]
    async fn command_without_action_forwards_with_urgency_priority() {
        let fx = fixture(false);
        let env = envelope("alpha", "beta", Channel::Command, Urgency::Later, "look into this");
        fx.router.route(env).await.unwrap();

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].priority, Urgency::Later);
        assert!(deliveries[0].note.is_none());
    }

    #[tokio::test]
    async fn command_with_known_action_publishes_result_and_reply() {
        let fx = fixture(false);
        let env = envelope("alpha", "beta", Channel::Command, Urgency::Now, "check")
            .with_action("disk-check");
        let source_id = env.id.clone();
        fx.router.route(env).await.unwrap();

        let published = fx.publisher.published.lock();
        assert_eq!(published.len(), 2);

        let (topic, payload, retain) = &published[0];
        assert_eq!(topic, "swarm/meta/beta/result/disk-check");
        assert!(retain);
        let result: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["result"]["free_gb"], 42);
        assert_eq!(result["source"], source_id);

        let (topic, payload, retain) = &published[1];
        assert_eq!(topic, "swarm/alpha/response");
        assert!(!retain);
        let reply = Envelope::from_slice(payload).unwrap();
        assert_eq!(reply.corr.as_deref(), Some(source_id.as_str()));
        assert_eq!(reply.reply_to.as_deref(), Some(source_id.as_str()));

        // Handled by automation, so nothing crosses the bridge.
        assert!(fx.bridge.deliveries.lock().is_empty());
    }

    #[tokio::test]
    async fn sync_with_action_publishes_result_but_no_reply() {
        let fx = fixture(false);
        let env = envelope("alpha", "all", Channel::Sync, Urgency::Later, "refresh")
            .with_action("disk-check");
        fx.router.route(env).await.unwrap();

        let published = fx.publisher.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "swarm/meta/beta/result/disk-check");
    }

    #[tokio::test]
    async fn sync_without_action_escalates_to_bridge() {
        let fx = fixture(false);
        let env = envelope("alpha", "all", Channel::Sync, Urgency::Later, "reconcile state");
        fx.router.route(env).await.unwrap();

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].envelope.text, "reconcile state");
        assert_eq!(deliveries[0].priority, Urgency::Later);
        assert!(fx.publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_sync_dispatch_escalates_with_failure_note() {
        let fx = fixture(true);
        let env = envelope("alpha", "all", Channel::Sync, Urgency::Later, "refresh")
            .with_action("broken");
        fx.router.route(env).await.unwrap();

        // Retained failure result only — no reply and no alert for sync.
        let published = fx.publisher.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "swarm/meta/beta/result/broken");

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].note.as_ref().unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn failed_handler_alerts_sender_when_configured() {
        let fx = fixture(true);
        let env = envelope("alpha", "beta", Channel::Command, Urgency::Now, "go")
            .with_action("broken");
        fx.router.route(env).await.unwrap();

        let published = fx.publisher.published.lock();
        // Retained failure result, error response, alert.
        assert_eq!(published.len(), 3);
        let result: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(result["ok"], false);
        assert_eq!(result["reason"], "exit");

        assert_eq!(published[2].0, "swarm/alpha/alert");
        let alert = Envelope::from_slice(&published[2].1).unwrap();
        assert_eq!(alert.ch, Channel::Alert);
        assert!(alert.text.contains("broken"));
    }

    #[tokio::test]
    async fn failed_handler_stays_quiet_when_alerts_disabled() {
        let fx = fixture(false);
        let env = envelope("alpha", "beta", Channel::Command, Urgency::Now, "go")
            .with_action("broken");
        fx.router.route(env).await.unwrap();
        // Result and response only, no alert envelope.
        assert_eq!(fx.publisher.published.lock().len(), 2);
    }

    #[tokio::test]
    async fn unknown_action_escalates_to_bridge_with_note() {
        let fx = fixture(false);
        let env = envelope("alpha", "beta", Channel::Command, Urgency::Now, "do the thing")
            .with_action("ghost");
        fx.router.route(env).await.unwrap();

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].envelope.text, "do the thing");
        assert!(deliveries[0].note.as_ref().unwrap().contains("ghost"));
        assert!(fx.publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn own_command_is_recorded_not_dispatched() {
        let fx = fixture(false);
        let env = envelope("beta", "alpha", Channel::Command, Urgency::Now, "remote job")
            .with_action("disk-check");
        let corr = env.id.clone();
        fx.router.route(env).await.unwrap();

        assert!(fx.correlation.lookup(&corr).is_some());
        assert!(fx.publisher.published.lock().is_empty());
        assert!(fx.bridge.deliveries.lock().is_empty());
    }

    #[tokio::test]
    async fn response_is_enriched_from_correlation_store() {
        let fx = fixture(false);
        let request = envelope("beta", "alpha", Channel::Command, Urgency::Now, "check disk");
        fx.correlation.record(&request);

        let response = envelope("alpha", "beta", Channel::Response, Urgency::Now, "disk ok")
            .with_corr(&request.id);
        fx.router.route(response).await.unwrap();

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(
            deliveries[0].note.as_deref(),
            Some("in reply to: check disk")
        );
        assert!(deliveries[0].session.is_none());
    }

    #[tokio::test]
    async fn correlation_miss_delivers_unenriched() {
        let fx = fixture(false);
        let response = envelope("alpha", "beta", Channel::Response, Urgency::Now, "late reply")
            .with_corr("long-gone");
        fx.router.route(response).await.unwrap();

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].note.is_none());
    }

    #[tokio::test]
    async fn pinned_session_targets_that_conversation() {
        let fx = fixture(false);
        fx.sessions.pin("k1", "conv-7", Some(600)).await.unwrap();

        let response = envelope("alpha", "beta", Channel::Response, Urgency::Now, "answer")
            .with_corr("k1");
        fx.router.route(response).await.unwrap();

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries[0].session.as_deref(), Some("conv-7"));
    }

    #[tokio::test]
    async fn response_without_corr_is_dropped() {
        let fx = fixture(false);
        let response = envelope("alpha", "beta", Channel::Response, Urgency::Now, "orphan");
        fx.router.route(response).await.unwrap();
        assert!(fx.bridge.deliveries.lock().is_empty());
    }

    #[tokio::test]
    async fn status_forwards_only_when_urgent() {
        let fx = fixture(false);
        let later = envelope("alpha", "beta", Channel::Status, Urgency::Later, "all good");
        fx.router.route(later).await.unwrap();
        assert!(fx.bridge.deliveries.lock().is_empty());

        let now = envelope("alpha", "beta", Channel::Status, Urgency::Now, "degraded");
        fx.router.route(now).await.unwrap();
        assert_eq!(fx.bridge.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn alert_is_always_immediate() {
        let fx = fixture(false);
        let env = envelope("alpha", "all", Channel::Alert, Urgency::Later, "disk full");
        fx.router.route(env).await.unwrap();

        let deliveries = fx.bridge.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].priority, Urgency::Now);
    }
}
