//! Error types for the subscription engine.

use crate::types::{Position, SubscriptionKey};
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscription not found: {0}")]
    NotFound(SubscriptionKey),

    #[error("Access denied for {principal} on {target}")]
    AccessDenied { principal: String, target: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Subscription not ready: {0}")]
    Unavailable(SubscriptionKey),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Checkpoint regression: {attempted:?} is behind {current:?}")]
    CheckpointRegression {
        attempted: Position,
        current: Position,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Checkpoint directory is locked by another process")]
    Locked,
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SubscriptionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubscriptionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubscriptionError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
