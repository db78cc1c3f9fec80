//! End-to-end workflow tests.
//!
//! These tests run whole workflows through `WorkflowRunner`: the full
//! pipeline, failure mid-way, resume without re-running finished steps, and
//! external command agents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use conductor::agent::{Agent, AgentRegistry};
use conductor::orchestration::{AgentExecutionManager, ResumeCalculator, WorkflowRunner};
use conductor::step::{StepKind, StepStatus};
use conductor::store::{ExecutionStore, JsonFileStore, MemoryStore};
use conductor::workflow::{WorkflowKind, WorkflowStatus};
use conductor::Error;

use crate::fixtures::{config, CountingAgent, EchoAgent, FlakyAgent, SleepAgent};

const PIPELINE: [StepKind; 6] = [
    StepKind::Plan,
    StepKind::Code,
    StepKind::SecurityLint,
    StepKind::Test,
    StepKind::Review,
    StepKind::Document,
];

fn echo_registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for kind in PIPELINE {
        registry.register(kind, Arc::new(EchoAgent(kind.as_str())));
    }
    registry
}

fn runner(store: Arc<dyn ExecutionStore>, registry: AgentRegistry) -> WorkflowRunner {
    let manager = AgentExecutionManager::new(store, registry, config(2, Duration::from_secs(5)));
    WorkflowRunner::new(manager, ResumeCalculator::default())
}

/// Test: Full pipeline
/// Given echo agents for every step
/// When a feature workflow runs
/// Then all six steps complete in order and each sees the previous output
#[tokio::test]
async fn test_feature_workflow_runs_full_pipeline() {
    let store = Arc::new(MemoryStore::new());
    let runner = runner(store.clone(), echo_registry());

    let workflow = runner
        .start(WorkflowKind::Feature, json!({"issue": 101}), Some("feat/login".into()))
        .await
        .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.completed_at.is_some());

    let steps = store.list_step_executions(workflow.id).await.unwrap();
    let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, PIPELINE.to_vec());
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(steps.iter().all(|s| s.retry_count == 0));

    assert_eq!(steps[0].input["previous"], json!(null));
    assert_eq!(steps[0].input["payload"], json!({"issue": 101}));
    assert_eq!(steps[0].input["workflow_id"], json!(workflow.id.to_string()));
    for pair in steps.windows(2) {
        assert_eq!(pair[1].input["previous"]["step"], json!(pair[0].kind.as_str()));
    }
    assert_eq!(runner.manager().running_count(), 0);
}

/// Test: Documentation pipeline
/// Given a documentation workflow
/// Then only Plan and Document run
#[tokio::test]
async fn test_documentation_workflow_runs_two_steps() {
    let store = Arc::new(MemoryStore::new());
    let runner = runner(store.clone(), echo_registry());

    let workflow = runner
        .start(WorkflowKind::Documentation, json!({}), None)
        .await
        .unwrap();
    let steps = store.list_step_executions(workflow.id).await.unwrap();
    let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![StepKind::Plan, StepKind::Document]);
}

/// Test: Failure then resume
/// Given a Test step that fails on its first attempt
/// When the workflow is resumed after the agent recovers
/// Then finished steps are not re-run, Test is retried with retry_count 1,
/// and the workflow completes
#[tokio::test]
async fn test_failed_workflow_resumes_without_rerunning() {
    let store = Arc::new(MemoryStore::new());
    let plan_calls = Arc::new(AtomicUsize::new(0));
    let (flaky, healed) = FlakyAgent::new();
    let attempts = Arc::clone(&flaky.attempts);

    let mut registry = echo_registry();
    registry.register(
        StepKind::Plan,
        Arc::new(CountingAgent {
            name: "plan",
            calls: Arc::clone(&plan_calls),
        }),
    );
    registry.register(StepKind::Test, Arc::new(flaky));
    let runner = runner(store.clone(), registry);

    let id = runner
        .create(WorkflowKind::Bugfix, json!({"issue": 7}), None)
        .await
        .unwrap();
    let err = runner.run(id).await.unwrap_err();
    assert!(matches!(err, Error::AgentExecution(ref msg) if msg == "flaky failure"));

    let workflow = store.get_workflow(id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    let report = runner
        .calculator()
        .analyze(&workflow, &store.list_step_executions(id).await.unwrap());
    assert!(report.resumable);
    assert_eq!(report.resume_offset, 3);

    healed.store(true, std::sync::atomic::Ordering::SeqCst);
    let workflow = runner.resume(id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    assert_eq!(plan_calls.load(Ordering::SeqCst), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let steps = store.list_step_executions(id).await.unwrap();
    assert_eq!(steps.len(), 7);
    let tests: Vec<_> = steps.iter().filter(|s| s.kind == StepKind::Test).collect();
    assert_eq!(tests.len(), 2);
    assert_eq!(tests[0].status, StepStatus::Failed);
    assert_eq!(tests[1].status, StepStatus::Completed);
    assert_eq!(tests[1].retry_count, 1);
    assert_eq!(tests[1].input["previous"]["step"], json!("security_lint"));
}

/// Test: Step timeout fails the workflow
/// Given a Code agent slower than the timeout
/// Then the workflow fails with a timeout and later steps never run
#[tokio::test]
async fn test_step_timeout_fails_workflow() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = echo_registry();
    registry.register(StepKind::Code, Arc::new(SleepAgent(Duration::from_secs(5))));
    let manager =
        AgentExecutionManager::new(store.clone(), registry, config(1, Duration::from_millis(50)));
    let runner = WorkflowRunner::new(manager, ResumeCalculator::default());

    let id = runner.create(WorkflowKind::Feature, json!({}), None).await.unwrap();
    let err = runner.run(id).await.unwrap_err();
    assert!(matches!(err, Error::AgentTimeout(ref msg) if msg.contains("timed out")));

    let steps = store.list_step_executions(id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(
        store.get_workflow(id).await.unwrap().unwrap().status,
        WorkflowStatus::Failed
    );
}

/// Test: Resume refused
/// Given a workflow that failed before any step completed
/// Then resume is refused and no new rows are created
#[tokio::test]
async fn test_resume_refused_without_progress() {
    let store = Arc::new(MemoryStore::new());
    let (flaky, _healed) = FlakyAgent::new();
    let mut registry = echo_registry();
    registry.register(StepKind::Plan, Arc::new(flaky));
    let runner = runner(store.clone(), registry);

    let id = runner.create(WorkflowKind::Refactor, json!({}), None).await.unwrap();
    assert!(runner.run(id).await.is_err());

    let err = runner.resume(id).await.unwrap_err();
    assert!(matches!(err, Error::ResumeNotAllowed { .. }));
    assert_eq!(store.list_step_executions(id).await.unwrap().len(), 1);
}

/// Test: Command agents against the file store
/// Given `cat` as every documentation step and a JSON file store
/// When the workflow runs
/// Then each step's output is its own input and the state survives reopen
#[cfg(unix)]
#[tokio::test]
async fn test_command_agents_with_file_store() {
    use conductor::agent::CommandAgent;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let store = Arc::new(JsonFileStore::open(&path).await.unwrap());

    let cat: Arc<dyn Agent> = Arc::new(CommandAgent::new("cat"));
    let registry = AgentRegistry::new()
        .with(StepKind::Plan, Arc::clone(&cat))
        .with(StepKind::Document, cat);
    let runner = runner(store.clone(), registry);

    let workflow = runner
        .start(WorkflowKind::Documentation, json!({"doc": "README"}), None)
        .await
        .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let steps = reopened.list_step_executions(workflow.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    for step in &steps {
        assert_eq!(step.output.as_ref(), Some(&step.input));
    }
    assert_eq!(steps[1].input["previous"]["payload"], json!({"doc": "README"}));
}
