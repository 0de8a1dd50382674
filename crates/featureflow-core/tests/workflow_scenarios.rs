//! End-to-end dispatcher scenarios over the built-in pipeline.

use std::sync::Arc;

use featureflow_core::fakes::{Scripted, ScriptedExecutor};
use featureflow_core::{
    BlockReason, BranchValue, Dispatcher, EntryPoint, FailureReport, GraphView, HaltReason,
    HandoffOutcome, Next, ProposedUpdate, RejectReason, RunOptions, StageId, StageResult,
    StageStatus, WorkflowConfig, WorkflowState,
};
use featureflow_store::fakes::MemoryDocumentStore;

fn sid(s: &str) -> StageId {
    StageId::new(s).unwrap()
}

fn dispatcher(executor: &Arc<ScriptedExecutor>) -> Dispatcher {
    let def = WorkflowConfig::default_pipeline().unwrap().build().unwrap();
    Dispatcher::new(
        Arc::new(def),
        executor.clone(),
        Arc::new(MemoryDocumentStore::new()),
    )
}

fn decided(value: BranchValue) -> Scripted {
    Scripted::Result(StageResult::success(ProposedUpdate::summary("chosen")).with_branch(value))
}

#[tokio::test]
async fn fresh_document_blocks_on_branch_then_follows_path_a_only() {
    let exec = Arc::new(ScriptedExecutor::new().then(
        "choose-approach",
        Scripted::Result(StageResult::success(ProposedUpdate::summary(
            "both approaches are viable",
        ))),
    ));
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::FullWorkflow, "offline favourites", RunOptions::default())
        .await
        .unwrap();
    match &report.state {
        WorkflowState::Blocked(BlockReason::BranchUndecided { stage, options }) => {
            assert_eq!(stage, &sid("choose-approach"));
            assert_eq!(
                options,
                &vec![(BranchValue::A, sid("implement")), (BranchValue::B, sid("modernize"))]
            );
        }
        other => panic!("expected BranchUndecided, got {other:?}"),
    }

    // Still blocked on a second pass: nothing is dispatched while undecided.
    let calls_before = exec.calls().len();
    let again = d
        .resume(&report.feature_id, EntryPoint::FullWorkflow, RunOptions::default())
        .await
        .unwrap();
    assert!(matches!(again.state, WorkflowState::Blocked(BlockReason::BranchUndecided { .. })));
    assert_eq!(exec.calls().len(), calls_before);

    let doc = d.decide_branch(&report.feature_id, BranchValue::A).await.unwrap();
    let graph = &d.definition().graph;
    assert_eq!(graph.next(&doc, &GraphView::full()), Next::Stage(sid("implement")));

    let done = d
        .resume(&report.feature_id, EntryPoint::FullWorkflow, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(done.state, WorkflowState::Done);

    let after: Vec<String> = exec.calls()[calls_before..]
        .iter()
        .map(|c| c.stage.to_string())
        .collect();
    assert_eq!(after, ["implement", "test", "build", "review"]);
    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.status(&sid("modernize")), Some(StageStatus::Skipped));
}

#[tokio::test]
async fn read_write_stage_adds_exactly_its_artifacts_and_one_entry() {
    let exec = Arc::new(ScriptedExecutor::new().then(
        "plan",
        Scripted::Result(StageResult::success(
            ProposedUpdate::summary("plan written")
                .with_artifacts(["docs/plan.md", "docs/tasks.md"])
                .unwrap(),
        )),
    ));
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::PlanOnly, "offline favourites", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.state, WorkflowState::Done);

    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.artifact_refs().len(), 2);
    assert_eq!(doc.handoff_log().len(), 1);
    assert_eq!(doc.handoff_log()[0].outcome, HandoffOutcome::Completed);
    assert_eq!(doc.handoff_log()[0].artifact_refs.len(), 2);
    assert_eq!(doc.status(&sid("plan")), Some(StageStatus::Complete));
    assert_eq!(doc.status(&sid("choose-approach")), Some(StageStatus::Pending));
}

#[tokio::test]
async fn repeated_state_management_failures_escalate_after_max_attempts() {
    let failure = || {
        Scripted::Result(StageResult::recoverable(FailureReport::categorized(
            "state-management",
            "@State mutated during view update",
        )))
    };
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then("choose-approach", decided(BranchValue::A))
            .then("build", failure())
            .then("build", failure())
            .then("build", failure())
            .then("build", failure()),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
        .await
        .unwrap();
    let summary = match &report.state {
        WorkflowState::Blocked(BlockReason::NeedsUserInput(summary)) => summary.clone(),
        other => panic!("expected NeedsUserInput, got {other:?}"),
    };
    assert_eq!(summary.stage, sid("build"));
    assert_eq!(summary.category, "state-management");
    assert_eq!(summary.attempts, 4);
    assert_eq!(summary.last_failure, "@State mutated during view update");

    let builds = exec.calls_for("build");
    assert_eq!(builds.len(), 4);
    assert_eq!(builds[0].role.as_str(), "builder");
    assert!(builds[1..].iter().all(|c| c.role.as_str() == "state-engineer"));

    let doc = d.load(&report.feature_id).await.unwrap();
    let build_log: Vec<_> = doc
        .handoff_log()
        .iter()
        .filter(|e| e.stage_id == sid("build"))
        .collect();
    assert_eq!(build_log.len(), 5);
    let attempts: Vec<u32> = build_log
        .iter()
        .filter_map(|e| match e.outcome {
            HandoffOutcome::RecoverableFailure { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2, 3, 4]);
    assert_eq!(
        build_log[4].outcome,
        HandoffOutcome::Escalated {
            category: "state-management".to_string(),
            attempts: 4
        }
    );
    assert_eq!(doc.status(&sid("build")), Some(StageStatus::Pending));

    // After a human fixes the problem, resuming starts a fresh attempt cycle.
    let resumed = d
        .resume(&report.feature_id, EntryPoint::FullWorkflow, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(resumed.state, WorkflowState::Done);
    let builds = exec.calls_for("build");
    assert_eq!(builds.len(), 5);
    assert_eq!(builds[4].input.attempt, 1);
    assert_eq!(builds[4].role.as_str(), "builder");
}

#[tokio::test]
async fn read_only_role_adding_artifact_halts_without_touching_artifacts() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then(
                "plan",
                Scripted::Result(StageResult::success(
                    ProposedUpdate::summary("plan").with_artifacts(["docs/plan.md"]).unwrap(),
                )),
            )
            .then("choose-approach", decided(BranchValue::A))
            .then(
                "review",
                Scripted::Result(StageResult::success(
                    ProposedUpdate::summary("review notes")
                        .with_artifacts(["REVIEW.md"])
                        .unwrap(),
                )),
            ),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
        .await
        .unwrap();
    match &report.state {
        WorkflowState::Halted(HaltReason::Rejected { stage, reason }) => {
            assert_eq!(stage, &sid("review"));
            assert!(matches!(
                reason,
                RejectReason::PermissionViolation { field, .. } if field == "artifact_refs"
            ));
        }
        other => panic!("expected a rejection halt, got {other:?}"),
    }

    let last = report.log_tail.last().unwrap();
    assert_eq!(
        last.outcome,
        HandoffOutcome::PermissionViolation {
            field: "artifact_refs".to_string()
        }
    );

    let doc = d.load(&report.feature_id).await.unwrap();
    let refs: Vec<&str> = doc.artifact_refs().iter().map(|r| r.as_str()).collect();
    assert_eq!(refs, ["docs/plan.md"]);
    assert_eq!(doc.status(&sid("review")), Some(StageStatus::Pending));
}

#[tokio::test]
async fn read_only_architect_cannot_flip_another_stage() {
    let exec = Arc::new(ScriptedExecutor::new().then(
        "choose-approach",
        Scripted::Result(
            StageResult::success(
                ProposedUpdate::summary("skip tests").with_status(sid("test"), StageStatus::Skipped),
            )
            .with_branch(BranchValue::A),
        ),
    ));
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        report.state,
        WorkflowState::Halted(HaltReason::Rejected {
            reason: RejectReason::PermissionViolation { .. },
            ..
        })
    ));
    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.branch_decision(), None);
    assert_eq!(doc.status(&sid("test")), Some(StageStatus::Pending));
}

#[tokio::test]
async fn test_only_with_pending_predecessors_blocks_without_invoking() {
    let exec = Arc::new(ScriptedExecutor::new());
    let d = dispatcher(&exec);

    let planned = d
        .start(EntryPoint::PlanOnly, "x", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(planned.state, WorkflowState::Done);
    let calls_before = exec.calls().len();

    let report = d
        .resume(&planned.feature_id, EntryPoint::TestOnly, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        report.state,
        WorkflowState::Blocked(BlockReason::MissingPredecessors {
            stage: sid("test"),
            missing: vec![sid("implement"), sid("modernize")],
        })
    );
    assert_eq!(exec.calls().len(), calls_before);
}

#[tokio::test]
async fn single_stage_entry_runs_only_its_stage() {
    let exec = Arc::new(ScriptedExecutor::new().then("choose-approach", decided(BranchValue::B)));
    let d = dispatcher(&exec);

    let first = d
        .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.state, WorkflowState::Done);
    d.reset_stage(&first.feature_id, &sid("build"), false)
        .await
        .unwrap();

    let calls_before = exec.calls().len();
    let report = d
        .resume(&first.feature_id, EntryPoint::BuildOnly, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.state, WorkflowState::Done);
    let new_calls: Vec<String> = exec.calls()[calls_before..]
        .iter()
        .map(|c| c.stage.to_string())
        .collect();
    assert_eq!(new_calls, ["build"]);
}

#[tokio::test]
async fn optional_documentation_stage_fans_out_over_sections() {
    let exec = Arc::new(ScriptedExecutor::new().then("choose-approach", decided(BranchValue::A)));
    let d = dispatcher(&exec);

    let report = d
        .start(
            EntryPoint::FullWorkflow,
            "x",
            RunOptions {
                with_optional: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(report.state, WorkflowState::Done);

    let mut sections: Vec<String> = exec
        .calls_for("document")
        .into_iter()
        .filter_map(|c| c.input.section)
        .collect();
    sections.sort();
    assert_eq!(sections, ["api", "overview", "usage"]);

    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.status(&sid("document")), Some(StageStatus::Complete));
    let entry = doc.latest_entry_for(&sid("document")).unwrap();
    assert!(entry.summary.contains("[overview]"));
    assert!(entry.summary.contains("[api]"));
}

#[tokio::test]
async fn failed_section_retries_the_whole_stage() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then("choose-approach", decided(BranchValue::A))
            .then(
                "document",
                Scripted::Result(StageResult::recoverable(FailureReport::new(
                    "section generation timed out",
                ))),
            ),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(
            EntryPoint::FullWorkflow,
            "x",
            RunOptions {
                with_optional: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(report.state, WorkflowState::Done);
    assert_eq!(exec.calls_for("document").len(), 6);

    let doc = d.load(&report.feature_id).await.unwrap();
    let failures = doc
        .handoff_log()
        .iter()
        .filter(|e| {
            e.stage_id == sid("document")
                && matches!(e.outcome, HandoffOutcome::RecoverableFailure { .. })
        })
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn fatal_failure_halts_and_preserves_document() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then("choose-approach", decided(BranchValue::A))
            .then(
                "implement",
                Scripted::Result(StageResult::fatal("target platform not supported")),
            ),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        report.state,
        WorkflowState::Halted(HaltReason::FatalFailure {
            stage: sid("implement"),
            detail: "target platform not supported".to_string(),
        })
    );
    assert_eq!(report.log_tail.len(), 4);

    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.status(&sid("plan")), Some(StageStatus::Complete));
    assert_eq!(doc.status(&sid("implement")), Some(StageStatus::Pending));
    assert_eq!(doc.branch_decision(), Some(BranchValue::A));
}

#[tokio::test]
async fn builder_may_skip_the_optional_documentation_stage() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then("choose-approach", decided(BranchValue::A))
            .then(
                "build",
                Scripted::Result(StageResult::success(
                    ProposedUpdate::summary("built; nothing user-facing changed")
                        .with_status(sid("document"), StageStatus::Skipped),
                )),
            ),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(
            EntryPoint::FullWorkflow,
            "internal refactor",
            RunOptions {
                with_optional: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(report.state, WorkflowState::Done);
    assert!(exec.calls_for("document").is_empty());

    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.status(&sid("document")), Some(StageStatus::Skipped));
    assert_eq!(doc.status(&sid("build")), Some(StageStatus::Complete));
    assert_eq!(
        doc.latest_entry_for(&sid("build")).unwrap().outcome,
        HandoffOutcome::Completed
    );
}

#[tokio::test]
async fn restating_a_settled_status_is_accepted() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then("choose-approach", decided(BranchValue::B))
            .then(
                "test",
                Scripted::Result(StageResult::success(
                    ProposedUpdate::summary("tests written")
                        .with_status(sid("plan"), StageStatus::Complete)
                        .with_status(sid("implement"), StageStatus::Skipped),
                )),
            ),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.state, WorkflowState::Done);
    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.status(&sid("plan")), Some(StageStatus::Complete));
    assert_eq!(doc.status(&sid("implement")), Some(StageStatus::Skipped));
}

#[tokio::test]
async fn restating_a_pending_status_halts_with_a_logged_violation() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then("choose-approach", decided(BranchValue::A))
            .then(
                "implement",
                Scripted::Result(StageResult::success(
                    ProposedUpdate::summary("implemented")
                        .with_status(sid("document"), StageStatus::Pending),
                )),
            ),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        report.state,
        WorkflowState::Halted(HaltReason::Rejected {
            stage: sid("implement"),
            reason: RejectReason::IllegalTransition {
                stage: sid("document"),
                from: StageStatus::Pending,
                to: StageStatus::Pending,
            },
        })
    );

    let last = report.log_tail.last().unwrap();
    assert_eq!(last.stage_id, sid("implement"));
    assert_eq!(
        last.outcome,
        HandoffOutcome::PermissionViolation {
            field: "stage_status.document".to_string()
        }
    );
    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.status(&sid("implement")), Some(StageStatus::Pending));
}

#[tokio::test]
async fn optional_stage_can_decline_itself() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .then("choose-approach", decided(BranchValue::A))
            .then(
                "document",
                Scripted::Result(StageResult::success(
                    ProposedUpdate::summary("no public API to document")
                        .with_status(sid("document"), StageStatus::Skipped),
                )),
            ),
    );
    let d = dispatcher(&exec);

    let report = d
        .start(
            EntryPoint::FullWorkflow,
            "x",
            RunOptions {
                with_optional: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(report.state, WorkflowState::Done);

    let doc = d.load(&report.feature_id).await.unwrap();
    assert_eq!(doc.status(&sid("document")), Some(StageStatus::Skipped));
    let entry = doc.latest_entry_for(&sid("document")).unwrap();
    assert_eq!(entry.outcome, HandoffOutcome::Skipped);
    assert!(entry.summary.contains("no public API to document"));
}
