//! Resume analysis tests over recorded step history.

use std::sync::Arc;

use tempfile::TempDir;

use conductor::orchestration::{
    reset_workflow_for_resume, DefaultResumePolicy, ResumeCalculator, ResumePolicy,
    SequencePolicy,
};
use conductor::step::StepKind;
use conductor::store::{ExecutionStore, JsonFileStore, MemoryStore};
use conductor::workflow::{WorkflowKind, WorkflowStatus};
use conductor::Error;

use crate::fixtures::{failed_workflow, record_completed, record_failed};

fn four_step_calculator() -> ResumeCalculator {
    ResumeCalculator::new(Arc::new(SequencePolicy::new(
        vec![StepKind::Plan, StepKind::Code, StepKind::Test, StepKind::Review],
        vec![StepKind::Orchestrator],
    )))
}

/// Test: Offset from the last completed kind
/// Given sequence [Plan, Code, Test, Review] where Plan and Test completed
/// and Code never ran
/// Then the offset points after Test, not after Plan
#[tokio::test]
async fn test_offset_after_last_completed_kind_with_gap() {
    let store = MemoryStore::new();
    let wf = failed_workflow(&store, WorkflowKind::Feature).await;
    record_completed(&store, wf, StepKind::Plan).await;
    record_completed(&store, wf, StepKind::Test).await;
    record_failed(&store, wf, StepKind::Review, "reviewer rejected").await;

    let calc = four_step_calculator();
    let workflow = store.get_workflow(wf).await.unwrap().unwrap();
    let steps = store.list_step_executions(wf).await.unwrap();
    let report = calc.analyze(&workflow, &steps);

    assert!(report.resumable);
    assert_eq!(report.resume_offset, 3);
    assert_eq!(report.remaining(calc.sequence(workflow.kind)), &[StepKind::Review]);
    assert_eq!(
        report.failed.as_ref().and_then(|f| f.error.as_deref()),
        Some("reviewer rejected")
    );
}

/// Test: Orchestrator-only progress
/// Given a failed workflow whose only completed row is Orchestrator
/// Then it is not resumable and reset is refused without side effects
#[tokio::test]
async fn test_orchestrator_only_is_not_resumable() {
    let store = MemoryStore::new();
    let wf = failed_workflow(&store, WorkflowKind::Feature).await;
    record_completed(&store, wf, StepKind::Orchestrator).await;
    record_failed(&store, wf, StepKind::Plan, "no plan").await;

    let calc = ResumeCalculator::default();
    let err = reset_workflow_for_resume(&store, &calc, wf).await.unwrap_err();
    match err {
        Error::ResumeNotAllowed { workflow_id, reason } => {
            assert_eq!(workflow_id, wf);
            assert!(!reason.is_empty());
        }
        other => panic!("expected ResumeNotAllowed, got {:?}", other),
    }

    let workflow = store.get_workflow(wf).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
}

/// Test: Analysis is pure
/// Given a resumable workflow
/// When it is analysed repeatedly
/// Then the store is unchanged and the report is identical
#[tokio::test]
async fn test_analysis_has_no_side_effects() {
    let store = MemoryStore::new();
    let wf = failed_workflow(&store, WorkflowKind::Refactor).await;
    record_completed(&store, wf, StepKind::Plan).await;
    record_completed(&store, wf, StepKind::Code).await;

    let calc = ResumeCalculator::default();
    let workflow = store.get_workflow(wf).await.unwrap().unwrap();
    let steps = store.list_step_executions(wf).await.unwrap();

    let first = calc.analyze(&workflow, &steps);
    let second = calc.analyze(&workflow, &steps);
    assert_eq!(first.resume_offset, second.resume_offset);
    assert_eq!(first.completed_kinds, second.completed_kinds);

    assert_eq!(store.get_workflow(wf).await.unwrap().unwrap(), workflow);
    assert_eq!(store.list_step_executions(wf).await.unwrap(), steps);
}

/// Test: Retries of one kind do not move the offset
#[tokio::test]
async fn test_repeated_completions_are_idempotent() {
    let store = MemoryStore::new();
    let wf = failed_workflow(&store, WorkflowKind::Bugfix).await;
    let calc = ResumeCalculator::default();

    record_completed(&store, wf, StepKind::Plan).await;
    let workflow = store.get_workflow(wf).await.unwrap().unwrap();
    let once = calc.analyze(&workflow, &store.list_step_executions(wf).await.unwrap());

    record_completed(&store, wf, StepKind::Plan).await;
    record_completed(&store, wf, StepKind::Plan).await;
    let thrice = calc.analyze(&workflow, &store.list_step_executions(wf).await.unwrap());

    assert_eq!(once.resume_offset, 1);
    assert_eq!(thrice.resume_offset, 1);
    assert_eq!(thrice.completed.len(), 3);
    assert_eq!(thrice.completed_kinds, vec![StepKind::Plan]);
}

/// Test: Custom policy
/// Given a policy that also excludes Document from progress
/// Then a Document-only history is not resumable
#[tokio::test]
async fn test_policy_controls_progress() {
    let store = MemoryStore::new();
    let wf = failed_workflow(&store, WorkflowKind::Documentation).await;
    record_completed(&store, wf, StepKind::Document).await;

    let workflow = store.get_workflow(wf).await.unwrap().unwrap();
    let steps = store.list_step_executions(wf).await.unwrap();

    let default = ResumeCalculator::default().analyze(&workflow, &steps);
    assert!(default.resumable);
    assert_eq!(default.resume_offset, 2);

    let strict = ResumeCalculator::new(Arc::new(SequencePolicy::new(
        DefaultResumePolicy
            .canonical_sequence(WorkflowKind::Documentation)
            .to_vec(),
        vec![StepKind::Orchestrator, StepKind::Document],
    )))
    .analyze(&workflow, &steps);
    assert!(!strict.resumable);
    assert_eq!(strict.resume_offset, 0);
}

/// Test: Resume from a persisted store
/// Given history written to a JSON file store
/// When the store is reopened
/// Then the same resume decision is made and reset is persisted
#[tokio::test]
async fn test_resume_from_reopened_file_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    let wf = {
        let store = JsonFileStore::open(&path).await.unwrap();
        let wf = failed_workflow(&store, WorkflowKind::Feature).await;
        record_completed(&store, wf, StepKind::Plan).await;
        record_completed(&store, wf, StepKind::Code).await;
        record_failed(&store, wf, StepKind::SecurityLint, "secret in diff").await;
        wf
    };

    let store = JsonFileStore::open(&path).await.unwrap();
    let report = reset_workflow_for_resume(&store, &ResumeCalculator::default(), wf)
        .await
        .unwrap();
    assert_eq!(report.resume_offset, 2);
    assert_eq!(report.completed.len(), 2);

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let workflow = reopened.get_workflow(wf).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Pending);
    assert!(workflow.completed_at.is_none());
}
