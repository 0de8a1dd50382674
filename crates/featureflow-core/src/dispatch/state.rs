//! Per-stage phases and whole-run states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dispatch::error::{DispatchError, DispatchResult};
use crate::domain::{FeatureId, HandoffEntry, StageId};
use crate::graph::BlockReason;
use crate::obs;
use crate::roles::RejectReason;

/// Where the dispatcher is with the active stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Idle,
    Dispatching,
    AwaitingResult,
    Applying,
}

impl StagePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagePhase::Idle => "idle",
            StagePhase::Dispatching => "dispatching",
            StagePhase::AwaitingResult => "awaiting_result",
            StagePhase::Applying => "applying",
        }
    }

    /// `Idle -> Dispatching -> AwaitingResult -> Applying -> Idle`.
    /// Cancellation may return to `Idle` from `Dispatching` or `AwaitingResult`.
    pub fn can_transition_to(self, next: StagePhase) -> bool {
        use StagePhase::*;
        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Dispatching, AwaitingResult)
                | (AwaitingResult, Applying)
                | (Applying, Idle)
                | (Dispatching, Idle)
                | (AwaitingResult, Idle)
        )
    }
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase tracker for one stage; every transition is checked and traced.
#[derive(Debug)]
pub struct StageMachine {
    stage: StageId,
    phase: StagePhase,
}

impl StageMachine {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            phase: StagePhase::Idle,
        }
    }

    pub fn phase(&self) -> StagePhase {
        self.phase
    }

    pub fn advance(&mut self, to: StagePhase) -> DispatchResult<()> {
        if !self.phase.can_transition_to(to) {
            return Err(DispatchError::IllegalPhase {
                stage: self.stage.clone(),
                from: self.phase,
                to,
            });
        }
        obs::emit_stage_phase(&self.stage, self.phase.as_str(), to.as_str());
        self.phase = to;
        Ok(())
    }
}

/// Why a run stopped before finishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    /// A proposed update was refused by the role registry or the graph.
    Rejected { stage: StageId, reason: RejectReason },
    FatalFailure { stage: StageId, detail: String },
    ExecutorError { stage: StageId, detail: String },
    UserCancelled,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Rejected { stage, reason } => write!(f, "stage {stage}: {reason}"),
            HaltReason::FatalFailure { stage, detail } => {
                write!(f, "stage {stage} failed: {detail}")
            }
            HaltReason::ExecutorError { stage, detail } => {
                write!(f, "executor error at stage {stage}: {detail}")
            }
            HaltReason::UserCancelled => f.write_str("cancelled by user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Blocked(BlockReason),
    Done,
    Halted(HaltReason),
}

impl WorkflowState {
    pub fn label(&self) -> &'static str {
        match self {
            WorkflowState::Running => "running",
            WorkflowState::Blocked(_) => "blocked",
            WorkflowState::Done => "done",
            WorkflowState::Halted(_) => "halted",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Blocked(reason) => write!(f, "blocked: {reason}"),
            WorkflowState::Halted(reason) => write!(f, "halted: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Outcome of one dispatcher run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub feature_id: FeatureId,
    pub entry_point: String,
    pub state: WorkflowState,
    /// Version of the last committed document.
    pub version: u64,
    pub log_tail: Vec<HandoffEntry>,
}
