//! TTL-bounded memory of outbound commands, keyed by correlation id.

use std::collections::HashMap;

use parking_lot::Mutex;
use swarm_protocol::Envelope;
use tracing::debug;

use crate::now_epoch;

/// What was asked, of whom, and until when the answer is worth enriching.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub text: String,
    pub to: String,
    pub created_at: u64,
    pub expires_at: u64,
}

/// Tracks command envelopes this node has seen itself publish.
///
/// Entries are not consumed on match: a duplicate or retried response gets
/// the same enrichment as the first, and only TTL expiry removes an entry.
/// A miss at lookup time is not an error — the response is simply delivered
/// without its request context.
pub struct CorrelationStore {
    entries: Mutex<HashMap<String, CorrelationEntry>>,
    ttl_secs: u64,
}

impl CorrelationStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_secs: ttl_secs.max(1),
        }
    }

    /// Record an outbound command. The key is the envelope's correlation id,
    /// falling back to its message id; the entry lives for the envelope's
    /// own ttl when it carries one, else the store default.
    pub fn record(&self, envelope: &Envelope) {
        self.record_at(envelope, now_epoch());
    }

    /// Clock-injected variant of [`record`](Self::record).
    pub fn record_at(&self, envelope: &Envelope, now: u64) {
        let key = envelope.corr_key().to_owned();
        let ttl = envelope.ttl.unwrap_or(self.ttl_secs).max(1);
        debug!(corr = %key, to = %envelope.to, ttl, "correlation recorded");
        self.entries.lock().insert(
            key,
            CorrelationEntry {
                text: envelope.text.clone(),
                to: envelope.to.clone(),
                created_at: now,
                expires_at: now.saturating_add(ttl),
            },
        );
    }

    /// Look up a live entry. Expired entries are pruned here rather than
    /// waiting for the sweep.
    pub fn lookup(&self, corr: &str) -> Option<CorrelationEntry> {
        self.lookup_at(corr, now_epoch())
    }

    /// Clock-injected variant of [`lookup`](Self::lookup).
    pub fn lookup_at(&self, corr: &str, now: u64) -> Option<CorrelationEntry> {
        let mut entries = self.entries.lock();
        match entries.get(corr) {
            Some(entry) if now < entry.expires_at => Some(entry.clone()),
            Some(_) => {
                entries.remove(corr);
                None
            }
            None => None,
        }
    }

    /// Drop every expired entry. Called from the daemon's periodic tick.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_epoch())
    }

    /// Clock-injected variant of [`sweep`](Self::sweep).
    pub fn sweep_at(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "correlation sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
