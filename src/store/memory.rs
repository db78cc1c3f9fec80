use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ExecutionStore, Records};
use crate::step::{ExecutionId, StepExecution, StepKind, StepUpdate};
use crate::workflow::{WorkflowExecution, WorkflowId, WorkflowKind, WorkflowStatus};
use crate::{clog_debug, Result};

/// In-memory execution store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow(
        &self,
        kind: WorkflowKind,
        payload: serde_json::Value,
        label: Option<String>,
    ) -> Result<WorkflowId> {
        let workflow = WorkflowExecution::new(kind, payload, label);
        let id = self.records.write().await.insert_workflow(workflow);
        clog_debug!("MemoryStore: created workflow {} ({})", id.short(), kind);
        Ok(id)
    }

    async fn update_workflow_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        label: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        records.workflow_mut(id)?.transition(status, label)
    }

    async fn reset_workflow(&self, id: WorkflowId) -> Result<()> {
        let mut records = self.records.write().await;
        records.workflow_mut(id)?.reset_for_resume()
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowExecution>> {
        Ok(self.records.read().await.workflow(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowExecution>> {
        Ok(self.records.read().await.workflows().to_vec())
    }

    async fn create_step_execution(
        &self,
        workflow_id: WorkflowId,
        kind: StepKind,
        input: serde_json::Value,
        retry_count: u32,
    ) -> Result<ExecutionId> {
        let step = StepExecution::new(workflow_id, kind, input, retry_count);
        self.records.write().await.insert_step(step)
    }

    async fn update_step_execution(&self, id: ExecutionId, update: StepUpdate) -> Result<()> {
        let mut records = self.records.write().await;
        records.step_mut(id)?.apply(update)
    }

    async fn get_step_execution(&self, id: ExecutionId) -> Result<Option<StepExecution>> {
        Ok(self.records.read().await.step(id).cloned())
    }

    async fn list_step_executions(&self, workflow_id: WorkflowId) -> Result<Vec<StepExecution>> {
        Ok(self.records.read().await.steps_for(workflow_id))
    }
}
