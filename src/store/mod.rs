//! Durable record of workflow and step state.
//!
//! The orchestration core only talks to storage through [`ExecutionStore`].
//! Every call is a single-row operation; nothing here needs cross-row
//! transactions. Two implementations ship with the crate:
//! - [`MemoryStore`] for embedding and tests
//! - [`JsonFileStore`] which persists a JSON snapshot after every mutation

mod file;
mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::step::{ExecutionId, StepExecution, StepKind, StepUpdate};
use crate::workflow::{WorkflowExecution, WorkflowId, WorkflowKind, WorkflowStatus};
use crate::{Error, Result};

pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// Narrow read/write interface over workflow and step records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow(
        &self,
        kind: WorkflowKind,
        payload: serde_json::Value,
        label: Option<String>,
    ) -> Result<WorkflowId>;

    /// Move a workflow forward. Backward moves fail with `InvalidTransition`.
    async fn update_workflow_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        label: Option<String>,
    ) -> Result<()>;

    /// Flip a Failed workflow back to Pending ahead of a resume.
    async fn reset_workflow(&self, id: WorkflowId) -> Result<()>;

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowExecution>>;

    /// All workflows in creation order.
    async fn list_workflows(&self) -> Result<Vec<WorkflowExecution>>;

    async fn create_step_execution(
        &self,
        workflow_id: WorkflowId,
        kind: StepKind,
        input: serde_json::Value,
        retry_count: u32,
    ) -> Result<ExecutionId>;

    async fn update_step_execution(&self, id: ExecutionId, update: StepUpdate) -> Result<()>;

    async fn get_step_execution(&self, id: ExecutionId) -> Result<Option<StepExecution>>;

    /// Every step row of a workflow in creation order.
    async fn list_step_executions(&self, workflow_id: WorkflowId) -> Result<Vec<StepExecution>>;
}

/// Record set shared by both store implementations.
///
/// Rows are kept in insertion order so listings come back in creation
/// order; the id indexes are rebuilt after deserialization.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Records {
    workflows: Vec<WorkflowExecution>,
    steps: Vec<StepExecution>,
    #[serde(skip)]
    workflow_index: HashMap<WorkflowId, usize>,
    #[serde(skip)]
    step_index: HashMap<ExecutionId, usize>,
}

impl Records {
    pub(crate) fn reindex(&mut self) {
        self.workflow_index = self
            .workflows
            .iter()
            .enumerate()
            .map(|(i, w)| (w.id, i))
            .collect();
        self.step_index = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, i))
            .collect();
    }

    pub(crate) fn insert_workflow(&mut self, workflow: WorkflowExecution) -> WorkflowId {
        let id = workflow.id;
        self.workflow_index.insert(id, self.workflows.len());
        self.workflows.push(workflow);
        id
    }

    pub(crate) fn workflow(&self, id: WorkflowId) -> Option<&WorkflowExecution> {
        self.workflow_index.get(&id).map(|&i| &self.workflows[i])
    }

    pub(crate) fn workflow_mut(&mut self, id: WorkflowId) -> Result<&mut WorkflowExecution> {
        match self.workflow_index.get(&id) {
            Some(&i) => Ok(&mut self.workflows[i]),
            None => Err(Error::WorkflowNotFound(id)),
        }
    }

    pub(crate) fn workflows(&self) -> &[WorkflowExecution] {
        &self.workflows
    }

    pub(crate) fn insert_step(&mut self, step: StepExecution) -> Result<ExecutionId> {
        if !self.workflow_index.contains_key(&step.workflow_id) {
            return Err(Error::WorkflowNotFound(step.workflow_id));
        }
        let id = step.id;
        self.step_index.insert(id, self.steps.len());
        self.steps.push(step);
        Ok(id)
    }

    pub(crate) fn step(&self, id: ExecutionId) -> Option<&StepExecution> {
        self.step_index.get(&id).map(|&i| &self.steps[i])
    }

    pub(crate) fn step_mut(&mut self, id: ExecutionId) -> Result<&mut StepExecution> {
        match self.step_index.get(&id) {
            Some(&i) => Ok(&mut self.steps[i]),
            None => Err(Error::StepNotFound(id)),
        }
    }

    pub(crate) fn steps_for(&self, workflow_id: WorkflowId) -> Vec<StepExecution> {
        self.steps
            .iter()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect()
    }
}
