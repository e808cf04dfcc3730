//! Error types for the backplane.

use crate::types::{MessageHandle, TopicKey};
use thiserror::Error;

/// Main error type for backplane operations.
#[derive(Debug, Error)]
pub enum BackplaneError {
    /// The requested handle predates the retained rewind window.
    ///
    /// Recoverable: the caller resubscribes without replay and accepts the gap.
    #[error("Replay out of range: {requested:?} is older than the retained window (oldest is {oldest})")]
    ReplayOutOfRange {
        requested: MessageHandle,
        oldest: u64,
    },

    #[error("Invalid topic key: {0}")]
    InvalidTopicKey(String),

    #[error("Invalid connection id: {0:?}")]
    InvalidConnectionId(String),

    #[error("Unknown hub: {0}")]
    UnknownHub(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Backplane is shutting down")]
    ShuttingDown,

    /// The topic actor stopped before answering. Retried internally.
    #[error("Topic actor stopped: {0}")]
    ActorStopped(TopicKey),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Membership store is locked by another process")]
    Locked,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl BackplaneError {
    /// True for the one error a subscriber is expected to recover from
    /// by resubscribing without replay.
    pub fn is_replay_out_of_range(&self) -> bool {
        matches!(self, BackplaneError::ReplayOutOfRange { .. })
    }
}

impl From<serde_json::Error> for BackplaneError {
    fn from(e: serde_json::Error) -> Self {
        BackplaneError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BackplaneError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BackplaneError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BackplaneError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BackplaneError::Deserialization(e.to_string())
    }
}

/// Result type for backplane operations.
pub type Result<T> = std::result::Result<T, BackplaneError>;
