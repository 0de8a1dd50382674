//! Domain-level error taxonomy for featureflow.

use crate::domain::ids::{BranchValue, StageId};
use crate::domain::document::StageStatus;

/// Errors produced when mutating a [`Document`](crate::domain::Document).
///
/// Every variant leaves the document exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("unknown stage: {0}")]
    UnknownStage(StageId),

    #[error("illegal transition for stage {stage}: {from} -> {to}")]
    IllegalTransition {
        stage: StageId,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("branch decision already set to {existing}; refusing {attempted}")]
    BranchAlreadySet {
        existing: BranchValue,
        attempted: BranchValue,
    },

    #[error("branch stage {0} cannot be reset once its decision is recorded")]
    BranchStageReset(StageId),
}

/// featureflow domain errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("invalid {kind} id: {value:?}")]
    InvalidId { kind: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("document {feature_id} does not match the configured stage graph: {detail}")]
    SchemaMismatch { feature_id: String, detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] featureflow_store::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for featureflow domain operations.
pub type Result<T> = std::result::Result<T, FlowError>;
