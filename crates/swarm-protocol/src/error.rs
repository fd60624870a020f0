//! Error taxonomy shared across the swarm crates.
//!
//! Everything here is recovered locally inside the daemon: a malformed
//! envelope is dropped after logging, a failed handler publishes a failure
//! result, a missing handler escalates to the agent bridge. None of these
//! may take the process down.

use thiserror::Error;

/// Errors that can occur in swarm protocol and sidecar operations.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Inbound payload failed to parse or validate. Drop and log.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// No executable registered for the action. Escalate to the agent bridge.
    #[error("no handler registered for action {0:?}")]
    HandlerNotFound(String),
    /// Handler exited non-zero or produced unusable output.
    #[error("handler {action:?} failed: {reason}")]
    HandlerFailure { action: String, reason: String },
    /// Handler exceeded its wall-clock budget and was killed.
    #[error("handler {action:?} timed out after {timeout_secs}s")]
    HandlerTimeout { action: String, timeout_secs: u64 },
    /// Client-tool synchronous wait elapsed without a correlated response.
    #[error("no correlated response within {0}s")]
    WaitTimeout(u64),
    /// Broker connection or publish failure.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience result type for swarm operations.
pub type SwarmResult<T> = Result<T, SwarmError>;

impl From<std::io::Error> for SwarmError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
