//! Cluster error types

use crate::fsm::Event;
use crate::state::Phase;
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== State Machine Errors ====================
    #[error("invalid transition: event '{event}' is not legal from state '{phase}'")]
    InvalidTransition { event: Event, phase: Phase },

    // ==================== Membership Errors ====================
    #[error("cluster join failed: {0}")]
    JoinFailed(String),

    // ==================== Orchestration Errors ====================
    #[error("{phase} phase timed out")]
    Timeout { phase: &'static str },

    #[error("reconfiguration superseded")]
    Cancelled,

    // ==================== Protocol Errors ====================
    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Internal Errors ====================
    #[error("state invariant violated: {0}")]
    FatalInvariant(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidTransition { .. }
                | ClusterError::JoinFailed(_)
                | ClusterError::Timeout { .. }
        )
    }

    /// Check if this is a fatal error requiring shutdown
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::FatalInvariant(_))
    }
}

// Conversion from serde_json for wire payloads
impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ClusterError {
    fn from(e: tokio::task::JoinError) -> Self {
        ClusterError::Internal(e.to_string())
    }
}
