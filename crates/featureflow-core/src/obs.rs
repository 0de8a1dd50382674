//! Structured lifecycle events for workflow runs.
//!
//! Every event carries an `event` field (`workflow.started`,
//! `stage.dispatched`, ...) so log pipelines can filter on it. Runs execute
//! inside [`workflow_span`], which tags everything with the feature id.

use tracing::{debug, info, warn};

use crate::domain::{FeatureId, RoleId, StageId};
use crate::roles::EscalationTier;

/// The `featureflow.workflow` span for one run.
///
/// Attach it with [`tracing::Instrument`] rather than entering it, so the
/// run future stays `Send`.
pub fn workflow_span(feature_id: &FeatureId, entry_point: &str) -> tracing::Span {
    tracing::info_span!(
        "featureflow.workflow",
        feature_id = %feature_id,
        entry_point = %entry_point,
    )
}

pub fn emit_workflow_started(feature_id: &FeatureId, entry_point: &str, version: u64) {
    info!(
        event = "workflow.started",
        feature_id = %feature_id,
        entry_point = %entry_point,
        version = version,
    );
}

pub fn emit_stage_dispatched(stage: &StageId, role: &RoleId, tier: EscalationTier, attempt: u32) {
    info!(
        event = "stage.dispatched",
        stage = %stage,
        role = %role,
        tier = %tier,
        attempt = attempt,
    );
}

/// Per-stage phase transitions are chatty; they log at debug.
pub fn emit_stage_phase(stage: &StageId, from: &str, to: &str) {
    debug!(event = "stage.phase", stage = %stage, from = from, to = to);
}

pub fn emit_stage_committed(stage: &StageId, version: u64, artifacts_added: usize) {
    info!(
        event = "stage.committed",
        stage = %stage,
        version = version,
        artifacts_added = artifacts_added,
    );
}

pub fn emit_stage_failed(stage: &StageId, outcome: &str, detail: &dyn std::fmt::Display) {
    warn!(event = "stage.failed", stage = %stage, outcome = outcome, detail = %detail);
}

pub fn emit_retry_decided(stage: &StageId, attempt: u32, category: &str, decision: &str) {
    info!(
        event = "retry.decided",
        stage = %stage,
        attempt = attempt,
        category = category,
        decision = decision,
    );
}

pub fn emit_workflow_finished(feature_id: &FeatureId, state: &str, version: u64, duration_ms: u64) {
    info!(
        event = "workflow.finished",
        feature_id = %feature_id,
        state = state,
        version = version,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_span_enter() {
        let id = FeatureId::new("feat-span").unwrap();
        let _entered = workflow_span(&id, "full-workflow").entered();
        emit_workflow_started(&id, "full-workflow", 1);
    }
}
