//! Dispatcher errors.
//!
//! These are infrastructure failures. Stage failures, permission
//! violations and cancellation are not errors: they end the run with a
//! [`WorkflowState`](super::state::WorkflowState) in the report.

use crate::dispatch::state::StagePhase;
use crate::domain::{DocumentError, FlowError, RoleId, StageId};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("illegal phase transition for stage {stage}: {from} -> {to}")]
    IllegalPhase {
        stage: StageId,
        from: StagePhase,
        to: StagePhase,
    },

    #[error("unknown stage: {0}")]
    UnknownStage(StageId),

    #[error("role {0} is not in the registry")]
    UnknownRole(RoleId),

    #[error("the configured graph has no branch stage")]
    NoBranchStage,

    #[error("branch stage {0} is not awaiting a decision")]
    NotAwaitingDecision(StageId),

    #[error("stage {0} lies on the branch path that was not chosen")]
    ResetOffPath(StageId),

    #[error("entry point {0} needs an existing feature (pass --feature)")]
    FeatureRequired(&'static str),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
