//! Sequential workflow driver on top of the execution manager.
//!
//! Runs the canonical step sequence of a workflow one step at a time,
//! threading each step's output into the next step's input, and records
//! the workflow's final status. Resuming a failed workflow skips the steps
//! the resume calculator reports as already done.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use super::manager::AgentExecutionManager;
use super::resume::{reset_workflow_for_resume, ResumeCalculator};
use crate::step::{StepExecution, StepKind, StepStatus};
use crate::workflow::{WorkflowExecution, WorkflowId, WorkflowKind, WorkflowStatus};
use crate::{clog, clog_error, Error, Result};

pub struct WorkflowRunner {
    manager: AgentExecutionManager,
    calculator: ResumeCalculator,
    step_wait: Option<Duration>,
}

impl WorkflowRunner {
    pub fn new(manager: AgentExecutionManager, calculator: ResumeCalculator) -> Self {
        Self {
            manager,
            calculator,
            step_wait: None,
        }
    }

    /// Bound how long the runner waits on each step. The manager's agent
    /// timeout still applies independently.
    pub fn with_step_wait(mut self, wait: Duration) -> Self {
        self.step_wait = Some(wait);
        self
    }

    pub fn manager(&self) -> &AgentExecutionManager {
        &self.manager
    }

    pub fn calculator(&self) -> &ResumeCalculator {
        &self.calculator
    }

    /// Record a new workflow without running it.
    pub async fn create(
        &self,
        kind: WorkflowKind,
        payload: serde_json::Value,
        label: Option<String>,
    ) -> Result<WorkflowId> {
        self.manager.store().create_workflow(kind, payload, label).await
    }

    /// Create a workflow and run its whole sequence.
    pub async fn start(
        &self,
        kind: WorkflowKind,
        payload: serde_json::Value,
        label: Option<String>,
    ) -> Result<WorkflowExecution> {
        let id = self.create(kind, payload, label).await?;
        self.run(id).await
    }

    /// Run a Pending workflow from its first step.
    pub async fn run(&self, workflow_id: WorkflowId) -> Result<WorkflowExecution> {
        self.drive(workflow_id, 0, serde_json::Value::Null).await
    }

    /// Reset a failed workflow and continue it from the resume offset.
    pub async fn resume(&self, workflow_id: WorkflowId) -> Result<WorkflowExecution> {
        let store = self.manager.store().as_ref();
        let report = reset_workflow_for_resume(store, &self.calculator, workflow_id).await?;
        let workflow = self.load(workflow_id).await?;

        let sequence = self.calculator.sequence(workflow.kind);
        let previous = report
            .resume_offset
            .checked_sub(1)
            .and_then(|i| sequence.get(i))
            .and_then(|kind| latest_output(&report.completed, *kind))
            .unwrap_or(serde_json::Value::Null);

        clog!(
            "resuming workflow={} at {}/{} remaining={:?}",
            workflow_id.short(),
            report.resume_offset,
            sequence.len(),
            report.remaining(sequence)
        );
        self.drive(workflow_id, report.resume_offset, previous).await
    }

    async fn drive(
        &self,
        workflow_id: WorkflowId,
        offset: usize,
        mut previous: serde_json::Value,
    ) -> Result<WorkflowExecution> {
        let store = self.manager.store();
        let workflow = self.load(workflow_id).await?;
        let sequence = self.calculator.sequence(workflow.kind).to_vec();

        let mut attempts: HashMap<StepKind, u32> = HashMap::new();
        for step in store.list_step_executions(workflow_id).await? {
            *attempts.entry(step.kind).or_default() += 1;
        }

        store
            .update_workflow_status(workflow_id, WorkflowStatus::InProgress, None)
            .await?;

        for kind in sequence.iter().skip(offset).copied() {
            let input = json!({
                "workflow_id": workflow_id.to_string(),
                "payload": workflow.payload,
                "previous": previous,
            });
            let retry_count = attempts.get(&kind).copied().unwrap_or(0);

            match self.run_step(workflow_id, kind, input, retry_count).await {
                Ok(output) => previous = output,
                Err(e) => {
                    clog_error!("workflow={} failed at {}: {}", workflow_id.short(), kind, e);
                    store
                        .update_workflow_status(workflow_id, WorkflowStatus::Failed, None)
                        .await?;
                    return Err(e);
                }
            }
        }

        store
            .update_workflow_status(workflow_id, WorkflowStatus::Completed, None)
            .await?;
        clog!("workflow={} completed", workflow_id.short());
        self.load(workflow_id).await
    }

    async fn run_step(
        &self,
        workflow_id: WorkflowId,
        kind: StepKind,
        input: serde_json::Value,
        retry_count: u32,
    ) -> Result<serde_json::Value> {
        let agent_id = self
            .manager
            .spawn_with_retry(workflow_id, kind, input, retry_count)
            .await?;
        self.manager.await_completion(agent_id, self.step_wait).await
    }

    async fn load(&self, workflow_id: WorkflowId) -> Result<WorkflowExecution> {
        self.manager
            .store()
            .get_workflow(workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound(workflow_id))
    }
}

fn latest_output(completed: &[StepExecution], kind: StepKind) -> Option<serde_json::Value> {
    completed
        .iter()
        .filter(|s| s.kind == kind && s.status == StepStatus::Completed)
        .max_by_key(|s| s.completed_at)
        .and_then(|s| s.output.clone())
}
