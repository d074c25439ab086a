//! Error types for the fact store.

use crate::types::{FactId, Serial};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fact not found: {0}")]
    FactNotFound(FactId),

    /// A fact with this id is already stored (or repeated within one batch).
    #[error("Duplicate fact id: {0}")]
    DuplicateFactId(FactId),

    #[error("Invalid fact {id}: {reason}")]
    InvalidFact { id: FactId, reason: String },

    #[error("Invalid filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("No transformation for {ns}/{fact_type} from version {from} to any of {requested:?}")]
    Transformation {
        ns: String,
        fact_type: String,
        from: u32,
        requested: Vec<u32>,
    },

    #[error("Transformation step {ns}/{fact_type} {from}->{to} failed: {reason}")]
    TransformationStep {
        ns: String,
        fact_type: String,
        from: u32,
        to: u32,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected at serial {serial}: {reason}")]
    Corruption { serial: Serial, reason: String },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    /// The listening connection was dropped or the store was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Subscription closed")]
    SubscriptionClosed,

    /// The consumer's delivery callback refused a fact.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// Caller errors fail subscription setup and are never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StoreError::FactNotFound(_)
                | StoreError::InvalidFilter { .. }
                | StoreError::InvalidFact { .. }
                | StoreError::DuplicateFactId(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
