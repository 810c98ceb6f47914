//! Delegation error types

use thiserror::Error;

use crate::ids::{NodeId, SessionId};

/// Errors that can occur in the delegation core
///
/// Only structural problems surface here. Anything that goes wrong while a
/// node works on a task is folded into a `DelegationResponse` instead.
#[derive(Debug, Error)]
pub enum DelegationError {
    /// Session does not exist
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Node does not exist in the session
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// A structure mutation was rejected
    #[error("Invalid structure change: {0}")]
    InvalidStructure(String),

    /// Collaborator service error
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Channel error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A delegation task panicked or was aborted
    #[error("Delegation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, DelegationError>;

/// Failure reported by an external collaborator (completion service,
/// classifier, structure lookup)
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service could not be reached or answered with a failure
    #[error("{0}")]
    Unavailable(String),

    /// The service answered but the answer was unusable
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The stream ended before producing a complete answer
    #[error("Stream interrupted: {0}")]
    Interrupted(String),

    /// Anything else a collaborator wants to report
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    /// Shorthand for [`ServiceError::Unavailable`]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}
