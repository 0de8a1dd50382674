//! Role registry and permission enforcement.
//!
//! A role is a capability profile: whether its executor may mutate the
//! document beyond the handoff log, and which reasoning tier it should be
//! run with. [`RoleRegistry::authorize`] is the gate every proposed update
//! passes before the dispatcher commits it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::{FlowError, Result};
use crate::domain::{ProposedUpdate, RoleId, StageId, StageStatus};

/// What a role's results may change in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPermission {
    /// Handoff log and the role's own advisories only.
    ReadOnly,
    ReadWrite,
}

/// Reasoning tier an executor should be run with for this role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTier {
    Fast,
    Balanced,
    HighReasoning,
}

impl fmt::Display for EscalationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationTier::Fast => "fast",
            EscalationTier::Balanced => "balanced",
            EscalationTier::HighReasoning => "high_reasoning",
        };
        write!(f, "{s}")
    }
}

/// Static definition of one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub id: RoleId,
    pub mutation_permission: MutationPermission,
    pub escalation_tier: EscalationTier,
    #[serde(default)]
    pub description: String,
}

impl RoleDefinition {
    pub fn is_read_only(&self) -> bool {
        self.mutation_permission == MutationPermission::ReadOnly
    }
}

/// Why a proposed update was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// A role tried to mutate something outside its capability.
    PermissionViolation { role: RoleId, field: String },
    /// A proposed status change breaks the monotonic transition rules.
    IllegalTransition {
        stage: StageId,
        from: StageStatus,
        to: StageStatus,
    },
    UnknownRole { role: RoleId },
    UnknownStage { stage: StageId },
}

impl RejectReason {
    /// The document field the rejection is about, for the handoff entry.
    pub fn field(&self) -> String {
        match self {
            RejectReason::PermissionViolation { field, .. } => field.clone(),
            RejectReason::IllegalTransition { stage, .. }
            | RejectReason::UnknownStage { stage } => format!("stage_status.{stage}"),
            RejectReason::UnknownRole { .. } => "role".to_string(),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::PermissionViolation { role, field } => {
                write!(f, "permission violation: read-only role {role} may not modify {field}")
            }
            RejectReason::IllegalTransition { stage, from, to } => {
                write!(f, "illegal transition for stage {stage}: {from} -> {to}")
            }
            RejectReason::UnknownRole { role } => write!(f, "unknown role {role}"),
            RejectReason::UnknownStage { stage } => write!(f, "unknown stage {stage}"),
        }
    }
}

/// Verdict of [`RoleRegistry::authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Accepted,
    Rejected(RejectReason),
}

impl Authorization {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Authorization::Accepted)
    }
}

/// Static table of roles, loaded once from configuration.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    roles: BTreeMap<RoleId, RoleDefinition>,
}

impl RoleRegistry {
    /// Build a registry, rejecting duplicate role ids.
    pub fn new(definitions: impl IntoIterator<Item = RoleDefinition>) -> Result<Self> {
        let mut roles = BTreeMap::new();
        for def in definitions {
            if roles.contains_key(&def.id) {
                return Err(FlowError::InvalidConfig(format!(
                    "duplicate role definition: {}",
                    def.id
                )));
            }
            roles.insert(def.id.clone(), def);
        }
        Ok(Self { roles })
    }

    pub fn get(&self, role: &RoleId) -> Option<&RoleDefinition> {
        self.roles.get(role)
    }

    pub fn contains(&self, role: &RoleId) -> bool {
        self.roles.contains_key(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoleDefinition> {
        self.roles.values()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Check `update`, proposed by `role` while executing `stage`, against the
    /// role's capability.
    ///
    /// A read-only role may only append to the log and add advisories: any
    /// artifact ref, or a status change for a stage other than its own, is
    /// `Rejected(PermissionViolation)`.
    pub fn authorize(
        &self,
        role: &RoleId,
        stage: &StageId,
        update: &ProposedUpdate,
    ) -> Authorization {
        let Some(def) = self.roles.get(role) else {
            return Authorization::Rejected(RejectReason::UnknownRole { role: role.clone() });
        };
        if !def.is_read_only() {
            return Authorization::Accepted;
        }

        if !update.artifact_refs.is_empty() {
            return Authorization::Rejected(RejectReason::PermissionViolation {
                role: role.clone(),
                field: "artifact_refs".to_string(),
            });
        }
        if let Some(change) = update.stage_status.iter().find(|c| &c.stage != stage) {
            return Authorization::Rejected(RejectReason::PermissionViolation {
                role: role.clone(),
                field: format!("stage_status.{}", change.stage),
            });
        }
        Authorization::Accepted
    }
}
