//! Host-local file mapping correlation ids to conversation handles.
//!
//! Shared between the client tool (writer, at send/reply time) and the
//! daemon (reader, at response-delivery time). Both ends of a correlation
//! may pin independently on their own hosts; the file never crosses the bus.
//! Persistence is best effort: a missing or corrupt file starts empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use swarm_protocol::SwarmResult;
use tracing::{debug, warn};

use crate::now_epoch;

/// Environment override for the map's location, mainly for tests and
/// multi-node setups on one host.
pub const SESSION_MAP_ENV: &str = "SWARM_SESSION_MAP";

const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionEntry {
    session: String,
    expires: u64,
}

/// File-backed correlation-to-conversation map.
///
/// Every operation reads the file, prunes expired entries, and (for writes)
/// persists atomically via a temp file rename. Last write wins when the
/// client tool and daemon race; the window is a single small-file write.
pub struct SessionMap {
    path: PathBuf,
}

impl SessionMap {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve the map location: `SWARM_SESSION_MAP` if set, otherwise the
    /// platform-local data directory.
    pub fn from_env() -> Self {
        let path = std::env::var_os(SESSION_MAP_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_path);
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pin `corr` to a conversation handle for `ttl_secs` (default one hour).
    pub async fn pin(&self, corr: &str, session: &str, ttl_secs: Option<u64>) -> SwarmResult<()> {
        self.pin_at(corr, session, ttl_secs, now_epoch()).await
    }

    /// Clock-injected variant of [`pin`](Self::pin).
    pub async fn pin_at(
        &self,
        corr: &str,
        session: &str,
        ttl_secs: Option<u64>,
        now: u64,
    ) -> SwarmResult<()> {
        let mut entries = self.load_live(now).await;
        let ttl = ttl_secs.unwrap_or(DEFAULT_TTL_SECS).max(1);
        entries.insert(
            corr.to_owned(),
            SessionEntry {
                session: session.to_owned(),
                expires: now.saturating_add(ttl),
            },
        );
        debug!(corr, session, ttl, "session pinned");
        self.save(&entries).await
    }

    /// Look up the conversation handle for `corr`, if a live pin exists.
    pub async fn resolve(&self, corr: &str) -> Option<String> {
        self.resolve_at(corr, now_epoch()).await
    }

    /// Clock-injected variant of [`resolve`](Self::resolve).
    pub async fn resolve_at(&self, corr: &str, now: u64) -> Option<String> {
        self.load_live(now)
            .await
            .get(corr)
            .map(|entry| entry.session.clone())
    }

    /// Remove a pin, persisting only when something actually changed.
    pub async fn unpin(&self, corr: &str) -> SwarmResult<()> {
        let now = now_epoch();
        let mut entries = self.load_live(now).await;
        if entries.remove(corr).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }

    async fn load_live(&self, now: u64) -> HashMap<String, SessionEntry> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };
        let mut entries: HashMap<String, SessionEntry> = match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "session map unreadable, starting empty");
                return HashMap::new();
            }
        };
        entries.retain(|_, entry| now < entry.expires);
        entries
    }

    async fn save(&self, entries: &HashMap<String, SessionEntry>) -> SwarmResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn default_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swarm")
        .join("session-map.json")
}
