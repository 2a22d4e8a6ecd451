// Error types for work claiming
//
// Conflict, task-not-found and run-not-found are *not* errors: they are
// ordinary claim outcomes (see claim::ClaimOutcome). Errors here mean the
// infrastructure failed and no progress is possible on this code path.

use thiserror::Error;

/// Result type alias for claim operations
pub type Result<T> = std::result::Result<T, ClaimError>;

/// Errors that can occur while claiming work.
///
/// `Clone` is required because a single poll-loop failure fans out to every
/// claim request still pending against that poller.
#[derive(Debug, Clone, Error)]
pub enum ClaimError {
    /// Hint transport failure (polling, releasing, claim-expiry messages)
    #[error("transport error: {0}")]
    Transport(String),

    /// Authoritative task store failure
    #[error("store error: {0}")]
    Store(String),

    /// Notification publish failure
    #[error("publish error: {0}")]
    Publish(String),

    /// Programmer error, e.g. requesting claims on a destroyed poller
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ClaimError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        ClaimError::Transport(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        ClaimError::Store(msg.into())
    }

    /// Create a publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        ClaimError::Publish(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ClaimError::InvalidState(msg.into())
    }
}
