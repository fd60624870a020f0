//! Request/reply bookkeeping local to one node.
//!
//! Two stores live here. The [`CorrelationStore`] remembers outbound commands
//! so a late response can be enriched with the request it answers. The
//! [`SessionMap`] pins a correlation id to a local conversation handle so a
//! response can be routed to the conversation that asked, instead of a shared
//! default context. Neither store is ever transmitted over the bus.

mod correlation;
mod session;

pub use correlation::{CorrelationEntry, CorrelationStore};
pub use session::{SESSION_MAP_ENV, SessionMap};

pub(crate) fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
