//! Message envelope for swarm protocol v1.
//!
//! The envelope is immutable once constructed; a reply is a *new* envelope
//! whose correlation and reply-link fields are derived from the original.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{SwarmError, SwarmResult};

/// Wire schema version carried in every envelope.
pub const SCHEMA_VERSION: u16 = 1;

/// Reserved recipient meaning "all nodes".
pub const BROADCAST: &str = "all";

/// Logical message channels (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Command,
    Response,
    Sync,
    Heartbeat,
    Status,
    Alert,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Sync => "sync",
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
            Self::Alert => "alert",
        }
    }

    /// All valid channel names, for CLI argument validation.
    pub fn all() -> [Channel; 6] {
        [
            Self::Command,
            Self::Response,
            Self::Sync,
            Self::Heartbeat,
            Self::Status,
            Self::Alert,
        ]
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(Self::Command),
            "response" => Ok(Self::Response),
            "sync" => Ok(Self::Sync),
            "heartbeat" => Ok(Self::Heartbeat),
            "status" => Ok(Self::Status),
            "alert" => Ok(Self::Alert),
            other => Err(SwarmError::MalformedEnvelope(format!(
                "invalid channel: {other:?}"
            ))),
        }
    }
}

/// Message urgency. Advisory except for the alert channel, which is always
/// treated as immediate by the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Now,
    Later,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::Later => "later",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Urgency {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "now" => Ok(Self::Now),
            "later" => Ok(Self::Later),
            other => Err(SwarmError::MalformedEnvelope(format!(
                "invalid urgency: {other:?}"
            ))),
        }
    }
}

/// Swarm protocol v1 message envelope.
///
/// Required fields: `v`, `id`, `ts`, `from`, `to`, `ch`, `urgency`, `text`.
/// Optional fields: `corr`, `replyTo`, `ttl`, `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u16,
    pub id: String,
    /// Send time, seconds since the UNIX epoch.
    pub ts: u64,
    pub from: String,
    pub to: String,
    pub ch: Channel,
    pub urgency: Urgency,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
    #[serde(
        default,
        rename = "replyTo",
        skip_serializing_if = "Option::is_none"
    )]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Envelope {
    /// Create a new envelope with a fresh id and the current timestamp.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        ch: Channel,
        urgency: Urgency,
        text: impl Into<String>,
    ) -> Self {
        Self {
            v: SCHEMA_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            ts: epoch_seconds(),
            from: from.into(),
            to: to.into(),
            ch,
            urgency,
            text: text.into(),
            corr: None,
            reply_to: None,
            ttl: None,
            action: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_corr(mut self, corr: impl Into<String>) -> Self {
        self.corr = Some(corr.into());
        self
    }

    /// Create a reply to this envelope.
    ///
    /// Sets `to` to the original sender, forces the response channel, and
    /// derives `corr` (original's corr if present, else original's id) and
    /// `reply_to` (always the original's id).
    pub fn reply(&self, from: impl Into<String>, text: impl Into<String>, urgency: Urgency) -> Self {
        let mut env = Self::new(from, self.from.clone(), Channel::Response, urgency, text);
        env.corr = Some(self.corr_key().to_owned());
        env.reply_to = Some(self.id.clone());
        env
    }

    /// The correlation key this envelope participates under: its `corr`
    /// field if set, else its own id.
    pub fn corr_key(&self) -> &str {
        self.corr.as_deref().unwrap_or(&self.id)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    /// Whether this envelope is addressed to `node_id` (directly or via the
    /// broadcast sentinel).
    pub fn addressed_to(&self, node_id: &str) -> bool {
        self.to == node_id || self.is_broadcast()
    }

    /// Validate required-field invariants beyond what serde enforces.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.v != SCHEMA_VERSION {
            return Err(SwarmError::MalformedEnvelope(format!(
                "unsupported schema version: {}",
                self.v
            )));
        }
        if self.id.is_empty() {
            return Err(SwarmError::MalformedEnvelope("id is required".into()));
        }
        if self.ts == 0 {
            return Err(SwarmError::MalformedEnvelope(
                "ts must be a positive integer".into(),
            ));
        }
        if self.from.is_empty() {
            return Err(SwarmError::MalformedEnvelope("from is required".into()));
        }
        if self.to.is_empty() {
            return Err(SwarmError::MalformedEnvelope("to is required".into()));
        }
        if self.text.is_empty() {
            return Err(SwarmError::MalformedEnvelope("text is required".into()));
        }
        Ok(())
    }

    /// Parse and validate an inbound bus payload.
    ///
    /// Every failure mode (bad UTF-8, bad JSON, unknown channel/urgency,
    /// missing fields, invariant violations) maps to `MalformedEnvelope` so
    /// the routing loop can log and drop without crashing.
    pub fn from_slice(payload: &[u8]) -> SwarmResult<Self> {
        let env: Self = serde_json::from_slice(payload)
            .map_err(|err| SwarmError::MalformedEnvelope(err.to_string()))?;
        env.validate()?;
        Ok(env)
    }

    /// Serialize to the compact wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new("alpha", "beta", Channel::Command, Urgency::Now, "check disk")
    }

    #[test]
    fn new_fills_id_and_timestamp() {
        let env = sample();
        assert_eq!(env.v, SCHEMA_VERSION);
        assert!(!env.id.is_empty());
        assert!(env.ts > 0);
        assert!(env.validate().is_ok());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(sample().id, sample().id);
    }

    #[test]
    fn reply_derives_corr_from_id_when_absent() {
        let original = sample();
        let reply = original.reply("beta", "disk ok", Urgency::Now);
        assert_eq!(reply.to, "alpha");
        assert_eq!(reply.ch, Channel::Response);
        assert_eq!(reply.corr.as_deref(), Some(original.id.as_str()));
        assert_eq!(reply.reply_to.as_deref(), Some(original.id.as_str()));
    }

    #[test]
    fn reply_preserves_existing_corr() {
        let original = sample().with_corr("corr-1");
        let reply = original.reply("beta", "disk ok", Urgency::Later);
        assert_eq!(reply.corr.as_deref(), Some("corr-1"));
        assert_eq!(reply.reply_to.as_deref(), Some(original.id.as_str()));
    }

    #[test]
    fn wire_field_names_match_protocol() {
        let env = sample().with_ttl(60);
        let reply = env.reply("beta", "ok", Urgency::Now);
        let json = reply.to_json();
        assert!(json.contains("\"from\":\"beta\""));
        assert!(json.contains("\"replyTo\""));
        assert!(json.contains("\"ch\":\"response\""));
        assert!(!json.contains("\"ttl\""), "unset optionals are omitted");
    }

    #[test]
    fn from_slice_rejects_unknown_channel() {
        let raw = br#"{"v":1,"id":"m1","ts":100,"from":"a","to":"b","ch":"gossip","urgency":"now","text":"hi"}"#;
        let err = Envelope::from_slice(raw).unwrap_err();
        assert!(matches!(err, SwarmError::MalformedEnvelope(_)));
    }

    #[test]
    fn from_slice_rejects_missing_required_field() {
        let raw = br#"{"v":1,"id":"m1","ts":100,"from":"a","ch":"command","urgency":"now","text":"hi"}"#;
        assert!(Envelope::from_slice(raw).is_err());
    }

    #[test]
    fn from_slice_rejects_bad_json() {
        assert!(Envelope::from_slice(b"not json at all").is_err());
    }

    #[test]
    fn from_slice_rejects_wrong_schema_version() {
        let raw = br#"{"v":2,"id":"m1","ts":100,"from":"a","to":"b","ch":"command","urgency":"now","text":"hi"}"#;
        let err = Envelope::from_slice(raw).unwrap_err();
        assert!(err.to_string().contains("schema version"));
    }

    #[test]
    fn from_slice_accepts_optional_fields() {
        let raw = br#"{"v":1,"id":"m1","ts":100,"from":"a","to":"b","ch":"sync","urgency":"later","text":"hi","corr":"c1","replyTo":"m0","ttl":30,"action":"probe"}"#;
        let env = Envelope::from_slice(raw).unwrap();
        assert_eq!(env.corr.as_deref(), Some("c1"));
        assert_eq!(env.reply_to.as_deref(), Some("m0"));
        assert_eq!(env.ttl, Some(30));
        assert_eq!(env.action.as_deref(), Some("probe"));
    }

    #[test]
    fn addressed_to_accepts_own_id_and_broadcast() {
        let direct = sample();
        assert!(direct.addressed_to("beta"));
        assert!(!direct.addressed_to("gamma"));

        let broadcast = Envelope::new("alpha", BROADCAST, Channel::Status, Urgency::Later, "up");
        assert!(broadcast.addressed_to("gamma"));
    }

    #[test]
    fn channel_parse_roundtrip() {
        for ch in Channel::all() {
            assert_eq!(ch.as_str().parse::<Channel>().unwrap(), ch);
        }
        assert!("gossip".parse::<Channel>().is_err());
    }
}
