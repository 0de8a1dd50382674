//! The dispatch loop.
//!
//! One stage is active at a time. Each iteration asks the graph for the next
//! stage, invokes its executor (or fans out over its sections), and commits
//! the outcome to a copy of the document that replaces the original only
//! once it has been persisted. Retry attempts and pending branch decisions
//! are read back from the handoff log, so a run can stop at any point and
//! be resumed from the stored document.

use std::sync::Arc;
use std::time::Instant;

use featureflow_store::DocumentStore;
use tokio::sync::watch;
use tracing::{debug, Instrument};

use crate::config::WorkflowDefinition;
use crate::dispatch::entry::EntryPoint;
use crate::dispatch::error::{DispatchError, DispatchResult};
use crate::dispatch::executor::{ExecutorError, StageExecutor, StageOutcome, StageResult, TaskInput};
use crate::dispatch::state::{HaltReason, StageMachine, StagePhase, WorkflowReport, WorkflowState};
use crate::domain::{
    BranchValue, Document, DocumentError, FeatureId, HandoffEntry, HandoffOutcome, ProposedUpdate,
    RoleId, StageId, StageStatus,
};
use crate::fanout::{fan_out, SubTask};
use crate::graph::{BlockReason, Next, StageDefinition};
use crate::obs;
use crate::persist::DocumentRepo;
use crate::retry::{self, FailureReport, RetryDecision};
use crate::roles::{Authorization, EscalationTier, RejectReason};

/// Per-run switches chosen at the entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub with_optional: bool,
}

enum StageFlow {
    Continue,
    Stop(WorkflowState),
}

/// Drives documents through the configured stage graph.
pub struct Dispatcher {
    def: Arc<WorkflowDefinition>,
    executor: Arc<dyn StageExecutor>,
    repo: DocumentRepo,
    cancel: Option<watch::Receiver<bool>>,
}

impl Dispatcher {
    pub fn new(
        def: Arc<WorkflowDefinition>,
        executor: Arc<dyn StageExecutor>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            def,
            executor,
            repo: DocumentRepo::new(store),
            cancel: None,
        }
    }

    /// Stop the run when `true` is sent. Honored between stages and while
    /// waiting on an executor; the last committed document is left as is.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.def
    }

    pub fn repo(&self) -> &DocumentRepo {
        &self.repo
    }

    pub async fn load(&self, feature_id: &FeatureId) -> DispatchResult<Document> {
        Ok(self.repo.load(feature_id, &self.def.graph).await?)
    }

    /// Create and persist a fresh document, then run it.
    pub async fn start(
        &self,
        entry: EntryPoint,
        description: &str,
        options: RunOptions,
    ) -> DispatchResult<WorkflowReport> {
        if entry.requires_existing() {
            return Err(DispatchError::FeatureRequired(entry.name()));
        }
        let mut doc = self
            .def
            .graph
            .new_document(FeatureId::generate(), description);
        doc.commit();
        self.repo.save(&doc).await?;
        self.run(doc, entry, options).await
    }

    /// Continue a stored document from wherever it stopped.
    pub async fn resume(
        &self,
        feature_id: &FeatureId,
        entry: EntryPoint,
        options: RunOptions,
    ) -> DispatchResult<WorkflowReport> {
        let doc = self.load(feature_id).await?;
        self.run(doc, entry, options).await
    }

    pub async fn run(
        &self,
        doc: Document,
        entry: EntryPoint,
        options: RunOptions,
    ) -> DispatchResult<WorkflowReport> {
        let span = obs::workflow_span(doc.feature_id(), entry.name());
        self.drive(doc, entry, options).instrument(span).await
    }

    async fn drive(
        &self,
        mut doc: Document,
        entry: EntryPoint,
        options: RunOptions,
    ) -> DispatchResult<WorkflowReport> {
        let started = Instant::now();
        let view = entry.view(&self.def.graph, &self.def.entry_points, options.with_optional);
        obs::emit_workflow_started(doc.feature_id(), entry.name(), doc.version());

        let state = loop {
            if self.is_cancelled() {
                break WorkflowState::Halted(HaltReason::UserCancelled);
            }
            match self.def.graph.next(&doc, &view) {
                Next::Done => break WorkflowState::Done,
                Next::Blocked(reason) => break WorkflowState::Blocked(reason),
                Next::Stage(stage) => {
                    if let StageFlow::Stop(state) = self.run_stage(&mut doc, &stage).await? {
                        break state;
                    }
                }
            }
        };

        obs::emit_workflow_finished(
            doc.feature_id(),
            state.label(),
            doc.version(),
            started.elapsed().as_millis() as u64,
        );
        Ok(WorkflowReport {
            feature_id: doc.feature_id().clone(),
            entry_point: entry.name().to_string(),
            state,
            version: doc.version(),
            log_tail: doc.handoff_tail(self.def.handoff_tail).to_vec(),
        })
    }

    /// One attempt at `stage_id`.
    async fn run_stage(&self, doc: &mut Document, stage_id: &StageId) -> DispatchResult<StageFlow> {
        let stage = self
            .def
            .graph
            .stage(stage_id)
            .ok_or_else(|| DispatchError::UnknownStage(stage_id.clone()))?;
        let attempt = retry::consecutive_failures(doc, &stage.id) + 1;
        let role = self.role_for_attempt(doc, stage, attempt);
        let tier = self
            .def
            .roles
            .get(&role)
            .map(|r| r.escalation_tier)
            .ok_or_else(|| DispatchError::UnknownRole(role.clone()))?;
        let input = self.task_input(doc, stage, &role, tier, attempt);

        let mut machine = StageMachine::new(stage.id.clone());
        machine.advance(StagePhase::Dispatching)?;
        obs::emit_stage_dispatched(&stage.id, &role, tier, attempt);
        machine.advance(StagePhase::AwaitingResult)?;

        let outcome = tokio::select! {
            biased;
            _ = cancelled(self.cancel.clone()) => None,
            result = self.invoke(stage, &role, input) => Some(result),
        };
        let Some(outcome) = outcome else {
            machine.advance(StagePhase::Idle)?;
            debug!(stage = %stage.id, "cancelled while awaiting executor");
            return Ok(StageFlow::Stop(WorkflowState::Halted(HaltReason::UserCancelled)));
        };

        machine.advance(StagePhase::Applying)?;
        let flow = match outcome {
            Err(e) => {
                let detail = e.to_string();
                obs::emit_stage_failed(&stage.id, "executor_error", &detail);
                self.record(
                    doc,
                    HandoffEntry::new(
                        stage.id.clone(),
                        role.clone(),
                        HandoffOutcome::FatalFailure {
                            detail: detail.clone(),
                        },
                        format!("executor error: {detail}"),
                    ),
                )
                .await?;
                StageFlow::Stop(WorkflowState::Halted(HaltReason::ExecutorError {
                    stage: stage.id.clone(),
                    detail,
                }))
            }
            Ok(result) => match result.status {
                StageOutcome::Success => self.apply_success(doc, stage, &role, result).await?,
                StageOutcome::RecoverableFailure => {
                    self.apply_recoverable(doc, stage, &role, result, attempt)
                        .await?
                }
                StageOutcome::FatalFailure => {
                    let detail = result.failure_detail();
                    obs::emit_stage_failed(&stage.id, "fatal_failure", &detail);
                    self.record(
                        doc,
                        HandoffEntry::new(
                            stage.id.clone(),
                            role.clone(),
                            HandoffOutcome::FatalFailure {
                                detail: detail.clone(),
                            },
                            result.updates.summary,
                        ),
                    )
                    .await?;
                    StageFlow::Stop(WorkflowState::Halted(HaltReason::FatalFailure {
                        stage: stage.id.clone(),
                        detail,
                    }))
                }
            },
        };
        machine.advance(StagePhase::Idle)?;
        Ok(flow)
    }

    async fn invoke(
        &self,
        stage: &StageDefinition,
        role: &RoleId,
        input: TaskInput,
    ) -> Result<StageResult, ExecutorError> {
        if stage.sections.is_empty() {
            return self.executor.invoke(role, &stage.id, input).await;
        }

        let tasks = stage
            .sections
            .iter()
            .map(|section| {
                let executor = Arc::clone(&self.executor);
                let role = role.clone();
                let stage_id = stage.id.clone();
                let input = input.for_section(section);
                SubTask::new(section.clone(), async move {
                    executor
                        .invoke(&role, &stage_id, input)
                        .await
                        .map_err(|e| e.to_string())
                })
            })
            .collect();
        let merged = fan_out(tasks, &self.def.fanout)
            .await
            .map_err(|e| ExecutorError::Failed(e.to_string()))?;
        Ok(merged.into_stage_result(self.def.partial_merge))
    }

    async fn apply_success(
        &self,
        doc: &mut Document,
        stage: &StageDefinition,
        role: &RoleId,
        result: StageResult,
    ) -> DispatchResult<StageFlow> {
        let update = result.updates;
        if let Err(reason) = self.vet(stage, role, &update, doc) {
            obs::emit_stage_failed(&stage.id, "permission_violation", &reason);
            self.record(
                doc,
                HandoffEntry::new(
                    stage.id.clone(),
                    role.clone(),
                    HandoffOutcome::PermissionViolation {
                        field: reason.field(),
                    },
                    reason.to_string(),
                ),
            )
            .await?;
            return Ok(StageFlow::Stop(WorkflowState::Halted(HaltReason::Rejected {
                stage: stage.id.clone(),
                reason,
            })));
        }

        let mut next = doc.clone();
        match self.fold_success(&mut next, stage, role, update, result.branch_value) {
            Ok(added) => {
                self.commit(doc, next).await?;
                obs::emit_stage_committed(&stage.id, doc.version(), added);
                Ok(StageFlow::Continue)
            }
            Err(e) => {
                let detail = e.to_string();
                obs::emit_stage_failed(&stage.id, "fatal_failure", &detail);
                self.record(
                    doc,
                    HandoffEntry::new(
                        stage.id.clone(),
                        role.clone(),
                        HandoffOutcome::FatalFailure {
                            detail: detail.clone(),
                        },
                        format!("update could not be applied: {detail}"),
                    ),
                )
                .await?;
                Ok(StageFlow::Stop(WorkflowState::Halted(HaltReason::FatalFailure {
                    stage: stage.id.clone(),
                    detail,
                })))
            }
        }
    }

    /// Fold a vetted update into `next`. Returns how many artifacts were new.
    ///
    /// An optional stage whose update skips itself is recorded as skipped
    /// rather than complete.
    fn fold_success(
        &self,
        next: &mut Document,
        stage: &StageDefinition,
        role: &RoleId,
        update: ProposedUpdate,
        branch_value: Option<BranchValue>,
    ) -> std::result::Result<usize, DocumentError> {
        next.add_advisories(role, &update.advisories);

        let mut skipped = Vec::new();
        let mut outcome = HandoffOutcome::Completed;
        if stage.is_branch() {
            let Some(value) = branch_value else {
                next.append_handoff(
                    HandoffEntry::new(
                        stage.id.clone(),
                        role.clone(),
                        HandoffOutcome::AwaitingDecision,
                        update.summary,
                    )
                    .with_hint(update.next_stage_hint),
                );
                debug!(stage = %stage.id, "branch stage finished without a decision");
                return Ok(0);
            };
            skipped = self.settle_branch(next, value)?;
            outcome = HandoffOutcome::Decided { value };
        }

        for change in &update.stage_status {
            next.apply_status(change)?;
        }
        let added = next.add_artifacts(&update.artifact_refs);
        if next.status(&stage.id) == Some(StageStatus::Skipped) {
            outcome = HandoffOutcome::Skipped;
        } else {
            next.mark_complete(&stage.id)?;
        }
        next.append_handoff(
            HandoffEntry::new(stage.id.clone(), role.clone(), outcome, update.summary)
                .with_artifacts(update.artifact_refs)
                .with_hint(update.next_stage_hint),
        );
        self.log_skipped(next, &skipped);
        Ok(added)
    }

    async fn apply_recoverable(
        &self,
        doc: &mut Document,
        stage: &StageDefinition,
        role: &RoleId,
        result: StageResult,
        attempt: u32,
    ) -> DispatchResult<StageFlow> {
        let failure = result
            .failure
            .unwrap_or_else(|| FailureReport::new("recoverable failure without detail"));
        let category = self.def.retry.category_name(&failure);
        obs::emit_stage_failed(&stage.id, "recoverable_failure", &failure.detail);

        let mut next = doc.clone();
        next.append_handoff(HandoffEntry::new(
            stage.id.clone(),
            role.clone(),
            HandoffOutcome::RecoverableFailure {
                category: category.clone(),
                attempt,
                detail: failure.detail.clone(),
            },
            format!("attempt {attempt} failed ({category})"),
        ));

        let flow = match self.def.retry.handle(stage, &failure, attempt) {
            RetryDecision::RetryHere { role: retry_role } => {
                let decision = format!("retry_here:{retry_role}");
                obs::emit_retry_decided(&stage.id, attempt, &category, &decision);
                StageFlow::Continue
            }
            RetryDecision::RerouteTo {
                role: retry_role, ..
            } => {
                let decision = format!("reroute:{retry_role}");
                obs::emit_retry_decided(&stage.id, attempt, &category, &decision);
                StageFlow::Continue
            }
            RetryDecision::Escalate(summary) => {
                obs::emit_retry_decided(&stage.id, attempt, &category, "escalate");
                next.append_handoff(HandoffEntry::new(
                    stage.id.clone(),
                    role.clone(),
                    HandoffOutcome::Escalated {
                        category,
                        attempts: attempt,
                    },
                    summary.to_string(),
                ));
                StageFlow::Stop(WorkflowState::Blocked(BlockReason::NeedsUserInput(summary)))
            }
        };
        self.commit(doc, next).await?;
        Ok(flow)
    }

    /// Resolve a branch stage that finished without choosing a path.
    pub async fn decide_branch(
        &self,
        feature_id: &FeatureId,
        value: BranchValue,
    ) -> DispatchResult<Document> {
        let mut doc = self.load(feature_id).await?;
        let branch = self
            .def
            .graph
            .branch_stage()
            .ok_or(DispatchError::NoBranchStage)?;
        if !self.def.graph.awaiting_decision(&doc, branch) {
            return Err(DispatchError::NotAwaitingDecision(branch.id.clone()));
        }

        let mut next = doc.clone();
        let skipped = self.settle_branch(&mut next, value)?;
        next.mark_complete(&branch.id)?;
        next.append_handoff(HandoffEntry::new(
            branch.id.clone(),
            branch.role.clone(),
            HandoffOutcome::Decided { value },
            format!("path {value} chosen by user"),
        ));
        self.log_skipped(&mut next, &skipped);
        self.commit(&mut doc, next).await?;
        obs::emit_stage_committed(&branch.id, doc.version(), 0);
        Ok(doc)
    }

    /// Return `stage_id` (and with `cascade`, its completed descendants) to
    /// `pending`. Returns the updated document and the stages that were reset.
    pub async fn reset_stage(
        &self,
        feature_id: &FeatureId,
        stage_id: &StageId,
        cascade: bool,
    ) -> DispatchResult<(Document, Vec<StageId>)> {
        let mut doc = self.load(feature_id).await?;
        let graph = &self.def.graph;
        let stage = graph
            .stage(stage_id)
            .ok_or_else(|| DispatchError::UnknownStage(stage_id.clone()))?;
        let decision = doc.branch_decision();
        if stage.is_branch() && decision.is_some() {
            return Err(DocumentError::BranchStageReset(stage.id.clone()).into());
        }
        if let Some(chosen) = decision {
            if graph
                .exclusive_to(chosen.other())
                .is_some_and(|s| s.contains(stage_id))
            {
                return Err(DispatchError::ResetOffPath(stage_id.clone()));
            }
        }

        let mut targets = vec![stage.id.clone()];
        if cascade {
            let descendants = graph.descendants(&stage.id);
            targets.extend(
                graph
                    .stages()
                    .iter()
                    .filter(|s| descendants.contains(&s.id))
                    .filter(|s| !(s.is_branch() && decision.is_some()))
                    .filter(|s| doc.status(&s.id) == Some(StageStatus::Complete))
                    .map(|s| s.id.clone()),
            );
        }

        let mut next = doc.clone();
        for target in &targets {
            next.reset_stage(target)?;
            let role = graph
                .stage(target)
                .map(|s| s.role.clone())
                .ok_or_else(|| DispatchError::UnknownStage(target.clone()))?;
            let summary = if target == stage_id {
                "reset by user".to_string()
            } else {
                format!("reset with {stage_id}")
            };
            next.append_handoff(HandoffEntry::new(
                target.clone(),
                role,
                HandoffOutcome::Reset,
                summary,
            ));
        }
        self.commit(&mut doc, next).await?;
        debug!(stage = %stage_id, reset = targets.len(), "stages reset");
        Ok((doc, targets))
    }

    /// Record `value` and skip the stages exclusive to the other path.
    fn settle_branch(
        &self,
        next: &mut Document,
        value: BranchValue,
    ) -> std::result::Result<Vec<StageId>, DocumentError> {
        next.set_branch(value)?;
        let mut skipped = Vec::new();
        if let Some(others) = self.def.graph.exclusive_to(value.other()) {
            for s in others {
                if next.status(s) == Some(StageStatus::Pending) {
                    next.mark_skipped(s)?;
                    skipped.push(s.clone());
                }
            }
        }
        Ok(skipped)
    }

    fn log_skipped(&self, next: &mut Document, skipped: &[StageId]) {
        let Some(value) = next.branch_decision() else {
            return;
        };
        for s in skipped {
            if let Some(def) = self.def.graph.stage(s) {
                next.append_handoff(HandoffEntry::new(
                    s.clone(),
                    def.role.clone(),
                    HandoffOutcome::Skipped,
                    format!("not on path {value}"),
                ));
            }
        }
    }

    /// Role authorization plus the graph's status-transition rules.
    fn vet(
        &self,
        stage: &StageDefinition,
        role: &RoleId,
        update: &ProposedUpdate,
        doc: &Document,
    ) -> std::result::Result<(), RejectReason> {
        if let Authorization::Rejected(reason) = self.def.roles.authorize(role, &stage.id, update) {
            return Err(reason);
        }
        for change in &update.stage_status {
            self.def.graph.vet_status_change(change, doc)?;
        }
        Ok(())
    }

    /// The role for this attempt: the stage's own on a first try, otherwise
    /// whatever the retry policy chose for the previous failure.
    fn role_for_attempt(&self, doc: &Document, stage: &StageDefinition, attempt: u32) -> RoleId {
        if attempt <= 1 {
            return stage.role.clone();
        }
        match doc.latest_entry_for(&stage.id).map(|e| &e.outcome) {
            Some(HandoffOutcome::RecoverableFailure {
                category, detail, ..
            }) => {
                let failure = FailureReport::categorized(category.clone(), detail.clone());
                match self.def.retry.handle(stage, &failure, attempt - 1) {
                    RetryDecision::RetryHere { role } | RetryDecision::RerouteTo { role, .. } => role,
                    RetryDecision::Escalate(_) => stage.role.clone(),
                }
            }
            _ => stage.role.clone(),
        }
    }

    fn task_input(
        &self,
        doc: &Document,
        stage: &StageDefinition,
        role: &RoleId,
        tier: EscalationTier,
        attempt: u32,
    ) -> TaskInput {
        let last_failure = if attempt > 1 {
            doc.latest_entry_for(&stage.id)
                .and_then(|e| match &e.outcome {
                    HandoffOutcome::RecoverableFailure { detail, .. } => Some(detail.clone()),
                    _ => None,
                })
        } else {
            None
        };
        TaskInput {
            feature_id: doc.feature_id().clone(),
            description: doc.description().to_string(),
            stage: stage.id.clone(),
            role: role.clone(),
            escalation_tier: tier,
            instructions: stage.instructions.clone(),
            attempt,
            last_failure,
            branch_decision: doc.branch_decision(),
            settled_stages: doc
                .stage_statuses()
                .iter()
                .filter(|e| e.status.is_settled())
                .map(|e| e.stage.clone())
                .collect(),
            artifact_refs: doc.artifact_refs().to_vec(),
            advisories: doc.advisories_for(role).to_vec(),
            recent_handoffs: doc.handoff_tail(self.def.handoff_tail).to_vec(),
            section: None,
        }
    }

    async fn record(&self, doc: &mut Document, entry: HandoffEntry) -> DispatchResult<()> {
        let mut next = doc.clone();
        next.append_handoff(entry);
        self.commit(doc, next).await
    }

    /// Seal `next`, persist it, and only then let it replace `doc`.
    async fn commit(&self, doc: &mut Document, mut next: Document) -> DispatchResult<()> {
        next.commit();
        self.repo.save(&next).await?;
        *doc = next;
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Resolves once cancellation is signalled; never, without a receiver or
/// after the sender is gone.
async fn cancelled(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
