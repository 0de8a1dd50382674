//! The shared coordination document and its handoff log.
//!
//! A [`Document`] is the only shared state of a workflow run. Executors never
//! touch it: they return a [`ProposedUpdate`], and the dispatcher applies it
//! here through methods that enforce the document invariants:
//!
//! - stage status only moves `pending -> complete | skipped`, or is reset
//!   explicitly through [`Document::reset_stage`];
//! - the branch decision is written once;
//! - artifact refs and the handoff log are append-only.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{DocumentError, Result};
use crate::domain::ids::{ArtifactRef, BranchValue, FeatureId, RoleId, StageId};

/// Progress of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Complete,
    Skipped,
}

impl StageStatus {
    /// Complete or skipped: satisfies a successor's predecessor constraint.
    pub fn is_settled(&self) -> bool {
        matches!(self, StageStatus::Complete | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Complete => "complete",
            StageStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// One `(stage, status)` pair; the status table keeps graph declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatusEntry {
    pub stage: StageId,
    pub status: StageStatus,
}

/// What a handoff entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandoffOutcome {
    Completed,
    /// Branch stage finished its analysis without choosing a path.
    AwaitingDecision,
    Decided {
        value: BranchValue,
    },
    Skipped,
    RecoverableFailure {
        category: String,
        attempt: u32,
        detail: String,
    },
    FatalFailure {
        detail: String,
    },
    PermissionViolation {
        field: String,
    },
    Escalated {
        category: String,
        attempts: u32,
    },
    Reset,
}

impl HandoffOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            HandoffOutcome::RecoverableFailure { .. }
                | HandoffOutcome::FatalFailure { .. }
                | HandoffOutcome::PermissionViolation { .. }
        )
    }

    /// Short label used in status tables and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            HandoffOutcome::Completed => "completed",
            HandoffOutcome::AwaitingDecision => "awaiting_decision",
            HandoffOutcome::Decided { .. } => "decided",
            HandoffOutcome::Skipped => "skipped",
            HandoffOutcome::RecoverableFailure { .. } => "recoverable_failure",
            HandoffOutcome::FatalFailure { .. } => "fatal_failure",
            HandoffOutcome::PermissionViolation { .. } => "permission_violation",
            HandoffOutcome::Escalated { .. } => "escalated",
            HandoffOutcome::Reset => "reset",
        }
    }
}

/// An immutable record of one stage completion, failure or control event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffEntry {
    /// 1-based position in the log, assigned on append.
    pub seq: u64,
    pub stage_id: StageId,
    pub executor_role: RoleId,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    #[serde(default)]
    pub artifact_refs: Vec<ArtifactRef>,
    /// Advisory only; never consulted for routing.
    #[serde(default)]
    pub next_stage_hint: Option<StageId>,
    pub outcome: HandoffOutcome,
}

impl HandoffEntry {
    pub fn new(
        stage_id: StageId,
        executor_role: RoleId,
        outcome: HandoffOutcome,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            stage_id,
            executor_role,
            timestamp: Utc::now(),
            summary: summary.into(),
            artifact_refs: Vec::new(),
            next_stage_hint: None,
            outcome,
        }
    }

    pub fn with_artifacts(mut self, refs: Vec<ArtifactRef>) -> Self {
        self.artifact_refs = refs;
        self
    }

    pub fn with_hint(mut self, hint: Option<StageId>) -> Self {
        self.next_stage_hint = hint;
        self
    }
}

/// A status change an executor proposes for some stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub stage: StageId,
    pub status: StageStatus,
}

/// Document changes proposed by an executor. Applied only after authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposedUpdate {
    pub summary: String,
    pub artifact_refs: Vec<ArtifactRef>,
    pub stage_status: Vec<StatusChange>,
    pub advisories: Vec<String>,
    pub next_stage_hint: Option<StageId>,
}

impl ProposedUpdate {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_artifacts<I, S>(mut self, refs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for r in refs {
            self.artifact_refs.push(ArtifactRef::new(r)?);
        }
        Ok(self)
    }

    pub fn with_advisory(mut self, note: impl Into<String>) -> Self {
        self.advisories.push(note.into());
        self
    }

    pub fn with_status(mut self, stage: StageId, status: StageStatus) -> Self {
        self.stage_status.push(StatusChange { stage, status });
        self
    }

    /// `true` when applying this update would only touch the log.
    pub fn is_log_only(&self) -> bool {
        self.artifact_refs.is_empty() && self.stage_status.is_empty() && self.advisories.is_empty()
    }
}

/// The single shared coordination document of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    feature_id: FeatureId,
    description: String,
    version: u64,
    stage_status: Vec<StageStatusEntry>,
    branch_decision: Option<BranchValue>,
    artifact_refs: Vec<ArtifactRef>,
    #[serde(default)]
    advisories: BTreeMap<RoleId, Vec<String>>,
    handoff_log: Vec<HandoffEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Document {
    /// A fresh document with every stage `pending`, at version 0.
    pub fn new(
        feature_id: FeatureId,
        description: impl Into<String>,
        stages: impl IntoIterator<Item = StageId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            feature_id,
            description: description.into(),
            version: 0,
            stage_status: stages
                .into_iter()
                .map(|stage| StageStatusEntry {
                    stage,
                    status: StageStatus::Pending,
                })
                .collect(),
            branch_decision: None,
            artifact_refs: Vec::new(),
            advisories: BTreeMap::new(),
            handoff_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn feature_id(&self) -> &FeatureId {
        &self.feature_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn stage_statuses(&self) -> &[StageStatusEntry] {
        &self.stage_status
    }

    pub fn status(&self, stage: &StageId) -> Option<StageStatus> {
        self.stage_status
            .iter()
            .find(|e| &e.stage == stage)
            .map(|e| e.status)
    }

    pub fn is_settled(&self, stage: &StageId) -> bool {
        self.status(stage).map(|s| s.is_settled()).unwrap_or(false)
    }

    pub fn branch_decision(&self) -> Option<BranchValue> {
        self.branch_decision
    }

    pub fn artifact_refs(&self) -> &[ArtifactRef] {
        &self.artifact_refs
    }

    pub fn advisories(&self) -> &BTreeMap<RoleId, Vec<String>> {
        &self.advisories
    }

    pub fn advisories_for(&self, role: &RoleId) -> &[String] {
        self.advisories.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn handoff_log(&self) -> &[HandoffEntry] {
        &self.handoff_log
    }

    /// The last `n` handoff entries, oldest first.
    pub fn handoff_tail(&self, n: usize) -> &[HandoffEntry] {
        let start = self.handoff_log.len().saturating_sub(n);
        &self.handoff_log[start..]
    }

    /// Most recent handoff entry recorded for `stage`.
    pub fn latest_entry_for(&self, stage: &StageId) -> Option<&HandoffEntry> {
        self.handoff_log.iter().rev().find(|e| &e.stage_id == stage)
    }

    fn entry_mut(&mut self, stage: &StageId) -> std::result::Result<&mut StageStatusEntry, DocumentError> {
        self.stage_status
            .iter_mut()
            .find(|e| &e.stage == stage)
            .ok_or_else(|| DocumentError::UnknownStage(stage.clone()))
    }

    fn transition(
        &mut self,
        stage: &StageId,
        to: StageStatus,
    ) -> std::result::Result<(), DocumentError> {
        let entry = self.entry_mut(stage)?;
        let from = entry.status;
        let allowed = matches!(
            (from, to),
            (StageStatus::Pending, StageStatus::Complete)
                | (StageStatus::Pending, StageStatus::Skipped)
                | (StageStatus::Complete, StageStatus::Complete)
                | (StageStatus::Skipped, StageStatus::Skipped)
        );
        if !allowed {
            return Err(DocumentError::IllegalTransition {
                stage: stage.clone(),
                from,
                to,
            });
        }
        entry.status = to;
        Ok(())
    }

    /// `pending -> complete`; idempotent on an already complete stage.
    pub fn mark_complete(&mut self, stage: &StageId) -> std::result::Result<(), DocumentError> {
        self.transition(stage, StageStatus::Complete)
    }

    /// `pending -> skipped`; idempotent on an already skipped stage.
    pub fn mark_skipped(&mut self, stage: &StageId) -> std::result::Result<(), DocumentError> {
        self.transition(stage, StageStatus::Skipped)
    }

    /// Apply a proposed status change through the monotonic transition rules.
    pub fn apply_status(&mut self, change: &StatusChange) -> std::result::Result<(), DocumentError> {
        self.transition(&change.stage, change.status)
    }

    /// The only way a stage returns to `pending`.
    pub fn reset_stage(&mut self, stage: &StageId) -> std::result::Result<(), DocumentError> {
        self.entry_mut(stage)?.status = StageStatus::Pending;
        Ok(())
    }

    /// Record the branch decision. A second call is rejected, whatever its value.
    pub fn set_branch(&mut self, value: BranchValue) -> std::result::Result<(), DocumentError> {
        if let Some(existing) = self.branch_decision {
            return Err(DocumentError::BranchAlreadySet {
                existing,
                attempted: value,
            });
        }
        self.branch_decision = Some(value);
        Ok(())
    }

    /// Append refs not already present. Returns how many were new.
    pub fn add_artifacts<'a>(&mut self, refs: impl IntoIterator<Item = &'a ArtifactRef>) -> usize {
        let mut added = 0;
        for r in refs {
            if !self.artifact_refs.contains(r) {
                self.artifact_refs.push(r.clone());
                added += 1;
            }
        }
        added
    }

    pub fn add_advisories(&mut self, role: &RoleId, notes: &[String]) {
        if notes.is_empty() {
            return;
        }
        self.advisories
            .entry(role.clone())
            .or_default()
            .extend(notes.iter().cloned());
    }

    /// Append to the handoff log, assigning the next sequence number.
    pub fn append_handoff(&mut self, mut entry: HandoffEntry) -> &HandoffEntry {
        entry.seq = self.handoff_log.len() as u64 + 1;
        self.handoff_log.push(entry);
        &self.handoff_log[self.handoff_log.len() - 1]
    }

    /// Seal a batch of changes: bump the version and the update timestamp.
    pub fn commit(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Pretty JSON, the persisted form.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
