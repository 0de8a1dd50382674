//! Error types for featureflow-store

use thiserror::Error;

/// Errors that can occur in the document persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No document stored under this feature id
    #[error("document not found: {feature_id}")]
    NotFound { feature_id: String },

    /// Feature id is not usable as a storage key
    #[error("invalid document key: {key}")]
    InvalidKey { key: String },

    /// Attempted to store a version that is not newer than the stored one
    #[error("version conflict for {feature_id}: stored v{stored}, attempted v{attempted}")]
    VersionConflict {
        feature_id: String,
        stored: u64,
        attempted: u64,
    },

    /// Stored bytes no longer match their recorded digest
    #[error("digest mismatch for {feature_id}: expected {expected}, got {actual}")]
    DigestMismatch {
        feature_id: String,
        expected: String,
        actual: String,
    },

    /// Store metadata could not be encoded or decoded
    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Background blocking task failed
    #[error("storage task failed: {0}")]
    Task(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
