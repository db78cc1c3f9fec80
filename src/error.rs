use std::time::Duration;

use thiserror::Error;

use crate::orchestration::AgentId;
use crate::step::{ExecutionId, StepKind};
use crate::workflow::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Agent capacity exceeded (max: {max})")]
    CapacityExceeded { max: usize },

    #[error("Agent timed out: {0}")]
    AgentTimeout(String),

    #[error("Agent execution failed: {0}")]
    AgentExecution(String),

    #[error("No agent registered for step kind: {0}")]
    AgentNotRegistered(StepKind),

    #[error("Execution manager has been shut down")]
    ManagerShutdown,

    #[error("Agent handle not found: {id}")]
    HandleNotFound { id: AgentId },

    #[error("No message received within {0:?}")]
    MessageTimeout(Duration),

    #[error("Request failed: {0}")]
    RemoteError(String),

    #[error("Message bus has been destroyed")]
    BusClosed,

    #[error("Workflow {workflow_id} cannot be resumed: {reason}")]
    ResumeNotAllowed {
        workflow_id: WorkflowId,
        reason: String,
    },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Step execution not found: {0}")]
    StepNotFound(ExecutionId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, Error>;
