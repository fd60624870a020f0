//! # swarm-protocol — wire contract for the swarm coordination bus
//!
//! Defines the envelope schema every node exchanges, the topic layout on the
//! broker, and the shared error taxonomy. Intentionally dependency-light
//! (no tokio, no transport) so daemon, CLI, and handlers can all use it as a
//! pure contract crate.
//!
//! ## Module Overview
//!
//! - [`envelope`] — `Envelope`, `Channel`, `Urgency`, construction and reply
//!   derivation rules
//! - [`topic`] — broker topic scheme (message topics, subscriptions, retained
//!   meta locations)
//! - [`error`] — `SwarmError`, `SwarmResult`

pub mod envelope;
pub mod error;
pub mod topic;

pub use envelope::{BROADCAST, Channel, Envelope, SCHEMA_VERSION, Urgency};
pub use error::{SwarmError, SwarmResult};
