//! The executor seam: what a stage is given and what it hands back.
//!
//! Executors never touch the document. They return a [`StageResult`] whose
//! [`ProposedUpdate`] the dispatcher authorizes and commits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    ArtifactRef, BranchValue, FeatureId, HandoffEntry, ProposedUpdate, RoleId, StageId,
};
use crate::retry::FailureReport;
use crate::roles::EscalationTier;

/// Everything an executor needs to perform one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub feature_id: FeatureId,
    pub description: String,
    pub stage: StageId,
    pub role: RoleId,
    pub escalation_tier: EscalationTier,
    pub instructions: String,
    /// 1 on the first try, incremented on every retry.
    pub attempt: u32,
    /// Detail of the failure that triggered this retry.
    pub last_failure: Option<String>,
    pub branch_decision: Option<BranchValue>,
    pub settled_stages: Vec<StageId>,
    pub artifact_refs: Vec<ArtifactRef>,
    /// Advisory notes previously recorded by this role.
    pub advisories: Vec<String>,
    pub recent_handoffs: Vec<HandoffEntry>,
    /// Set when the stage is fanned out; the region this invocation owns.
    pub section: Option<String>,
}

impl TaskInput {
    pub fn for_section(&self, section: &str) -> Self {
        Self {
            section: Some(section.to_string()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    RecoverableFailure,
    FatalFailure,
}

/// What an executor returns for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageOutcome,
    #[serde(default)]
    pub updates: ProposedUpdate,
    /// Required from a branch stage's successful result.
    #[serde(default)]
    pub branch_value: Option<BranchValue>,
    #[serde(default)]
    pub failure: Option<FailureReport>,
}

impl StageResult {
    pub fn success(updates: ProposedUpdate) -> Self {
        Self {
            status: StageOutcome::Success,
            updates,
            branch_value: None,
            failure: None,
        }
    }

    pub fn with_branch(mut self, value: BranchValue) -> Self {
        self.branch_value = Some(value);
        self
    }

    pub fn recoverable(failure: FailureReport) -> Self {
        Self {
            status: StageOutcome::RecoverableFailure,
            updates: ProposedUpdate::default(),
            branch_value: None,
            failure: Some(failure),
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self {
            status: StageOutcome::FatalFailure,
            updates: ProposedUpdate::default(),
            branch_value: None,
            failure: Some(FailureReport::new(detail)),
        }
    }

    /// Failure detail, or a placeholder naming the outcome when the executor
    /// sent none.
    pub fn failure_detail(&self) -> String {
        match &self.failure {
            Some(f) => f.detail.clone(),
            None => format!("{:?} without detail", self.status),
        }
    }
}

/// Errors invoking an executor. The dispatcher treats all of them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no executor configured for role {0}")]
    NotConfigured(RoleId),

    #[error("executor for {role} timed out after {secs}s")]
    Timeout { role: RoleId, secs: u64 },

    #[error("executor for {role} exited with {code}: {stderr}")]
    NonZeroExit {
        role: RoleId,
        code: String,
        stderr: String,
    },

    #[error("executor returned malformed output: {0}")]
    InvalidOutput(String),

    #[error("executor failed: {0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Performs stage work on behalf of a role.
///
/// `role` may differ from the stage's own role when the retry policy
/// reroutes a failure to a specialist.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn invoke(
        &self,
        role: &RoleId,
        stage: &StageId,
        input: TaskInput,
    ) -> Result<StageResult, ExecutorError>;
}
