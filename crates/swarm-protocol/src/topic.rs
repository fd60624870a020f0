//! Broker topic scheme.
//!
//! Messages travel on `{prefix}/{to}/{channel}`. Retained meta topics under
//! `{prefix}/meta/{node}/...` form the broker-held cluster snapshot (no
//! separate database).

use crate::envelope::{BROADCAST, Channel};

/// Topic an envelope is published to.
pub fn message(prefix: &str, to: &str, ch: Channel) -> String {
    format!("{prefix}/{to}/{ch}")
}

/// Subscriptions for a sidecar: everything addressed to this node,
/// cluster-wide broadcasts, and all command traffic (the latter only so the
/// node can observe its *own* outbound commands for correlation tracking).
pub fn node_subscriptions(prefix: &str, node_id: &str) -> Vec<String> {
    vec![
        format!("{prefix}/{node_id}/+"),
        format!("{prefix}/{BROADCAST}/+"),
        format!("{prefix}/+/command"),
    ]
}

/// Retained per-node liveness state.
pub fn state(prefix: &str, node_id: &str) -> String {
    format!("{prefix}/meta/{node_id}/state")
}

/// Wildcard over all nodes' retained state.
pub fn state_filter(prefix: &str) -> String {
    format!("{prefix}/meta/+/state")
}

/// Retained per-node handler roster.
pub fn roster(prefix: &str, node_id: &str) -> String {
    format!("{prefix}/meta/{node_id}/roster")
}

/// Wildcard over all nodes' retained rosters.
pub fn roster_filter(prefix: &str) -> String {
    format!("{prefix}/meta/+/roster")
}

/// Retained latest result for one action on one node.
pub fn action_result(prefix: &str, node_id: &str, action: &str) -> String {
    format!("{prefix}/meta/{node_id}/result/{action}")
}

/// Extract the node segment from a retained meta topic
/// (`{prefix}/meta/{node}/...`). Safe for multi-segment prefixes.
pub fn meta_node<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(prefix)?
        .strip_prefix("/meta/")?
        .split('/')
        .next()
        .filter(|node| !node.is_empty())
}

/// Extract the channel segment from a message topic, if the topic matches
/// `{prefix}/{target}/{channel}`.
pub fn channel_of(prefix: &str, topic: &str) -> Option<Channel> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let _target = parts.next()?;
    let channel = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    channel.parse().ok()
}
