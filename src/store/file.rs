use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ExecutionStore, Records};
use crate::step::{ExecutionId, StepExecution, StepKind, StepUpdate};
use crate::util::blocking;
use crate::workflow::{WorkflowExecution, WorkflowId, WorkflowKind, WorkflowStatus};
use crate::{clog_debug, clog_error, Result};

/// Execution store persisted as a JSON snapshot.
///
/// Every mutation is applied to a copy of the records, written to a temp
/// file and renamed over the snapshot, and only then made visible. A failed
/// write leaves both disk and memory at the previous state.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading any existing snapshot.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let load_path = path.clone();
        let records = blocking(move || load_records(&load_path)).await?;
        clog_debug!(
            "JsonFileStore::open path={} workflows={}",
            path.display(),
            records.workflows().len()
        );
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Records) -> Result<T>,
    {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let out = f(&mut next)?;

        let contents = serde_json::to_string_pretty(&next)?;
        let path = self.path.clone();
        if let Err(e) = blocking(move || write_snapshot(&path, &contents)).await {
            clog_error!("JsonFileStore: failed to persist {}: {}", self.path.display(), e);
            return Err(e);
        }

        *records = next;
        Ok(out)
    }
}

fn load_records(path: &Path) -> Result<Records> {
    if !path.exists() {
        return Ok(Records::default());
    }
    let contents = fs::read_to_string(path)?;
    let mut records: Records = serde_json::from_str(&contents)?;
    records.reindex();
    Ok(records)
}

fn write_snapshot(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[async_trait]
impl ExecutionStore for JsonFileStore {
    async fn create_workflow(
        &self,
        kind: WorkflowKind,
        payload: serde_json::Value,
        label: Option<String>,
    ) -> Result<WorkflowId> {
        let workflow = WorkflowExecution::new(kind, payload, label);
        self.mutate(move |records| Ok(records.insert_workflow(workflow)))
            .await
    }

    async fn update_workflow_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        label: Option<String>,
    ) -> Result<()> {
        self.mutate(move |records| records.workflow_mut(id)?.transition(status, label))
            .await
    }

    async fn reset_workflow(&self, id: WorkflowId) -> Result<()> {
        self.mutate(move |records| records.workflow_mut(id)?.reset_for_resume())
            .await
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowExecution>> {
        Ok(self.records.lock().await.workflow(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowExecution>> {
        Ok(self.records.lock().await.workflows().to_vec())
    }

    async fn create_step_execution(
        &self,
        workflow_id: WorkflowId,
        kind: StepKind,
        input: serde_json::Value,
        retry_count: u32,
    ) -> Result<ExecutionId> {
        let step = StepExecution::new(workflow_id, kind, input, retry_count);
        self.mutate(move |records| records.insert_step(step)).await
    }

    async fn update_step_execution(&self, id: ExecutionId, update: StepUpdate) -> Result<()> {
        self.mutate(move |records| records.step_mut(id)?.apply(update))
            .await
    }

    async fn get_step_execution(&self, id: ExecutionId) -> Result<Option<StepExecution>> {
        Ok(self.records.lock().await.step(id).cloned())
    }

    async fn list_step_executions(&self, workflow_id: WorkflowId) -> Result<Vec<StepExecution>> {
        Ok(self.records.lock().await.steps_for(workflow_id))
    }
}
