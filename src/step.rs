//! Step execution data model.
//!
//! A step execution is one attempt to run one step of a workflow. Several
//! rows may exist for the same (workflow, kind) pair across retries and
//! resumes; rows are unique only by [`ExecutionId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowId;
use crate::{Error, Result};

/// Unique identifier for a step execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The capability a step exercises.
///
/// `Orchestrator` is reserved for the coordinating step itself and never
/// counts as progress when deciding whether a workflow can resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Plan,
    Code,
    SecurityLint,
    Test,
    Review,
    Document,
    Orchestrator,
}

impl StepKind {
    pub const ALL: [StepKind; 7] = [
        StepKind::Plan,
        StepKind::Code,
        StepKind::SecurityLint,
        StepKind::Test,
        StepKind::Review,
        StepKind::Document,
        StepKind::Orchestrator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Plan => "plan",
            StepKind::Code => "code",
            StepKind::SecurityLint => "security_lint",
            StepKind::Test => "test",
            StepKind::Review => "review",
            StepKind::Document => "document",
            StepKind::Orchestrator => "orchestrator",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| Error::Validation(format!("unknown step kind: {}", s)))
    }
}

/// Step status in its lifecycle.
///
/// Pending -> Running -> {Completed, Failed}. A step cancelled before it
/// started goes straight from Pending to Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition(&self, target: StepStatus) -> bool {
        matches!(
            (self, target),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Failed)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A status change requested of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StepUpdate {
    pub fn running() -> Self {
        Self {
            status: StepStatus::Running,
            output: None,
            error: None,
        }
    }

    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// One attempt to run one step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub kind: StepKind,
    pub status: StepStatus,
    /// Snapshot of the input the agent was given.
    pub input: serde_json::Value,
    /// Present only when Completed.
    pub output: Option<serde_json::Value>,
    /// Present only when Failed.
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set if and only if the status is terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(
        workflow_id: WorkflowId,
        kind: StepKind,
        input: serde_json::Value,
        retry_count: u32,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            kind,
            status: StepStatus::Pending,
            input,
            output: None,
            error: None,
            retry_count,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a status update, rejecting anything that is not a forward move.
    pub fn apply(&mut self, update: StepUpdate) -> Result<()> {
        if !self.status.can_transition(update.status) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: update.status.to_string(),
            });
        }

        let now = Utc::now();
        self.status = update.status;
        match update.status {
            StepStatus::Pending => {}
            StepStatus::Running => {
                self.started_at = Some(now);
            }
            StepStatus::Completed => {
                self.output = Some(update.output.unwrap_or(serde_json::Value::Null));
                self.error = None;
                self.completed_at = Some(now);
            }
            StepStatus::Failed => {
                self.output = None;
                self.error = Some(
                    update
                        .error
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
                self.completed_at = Some(now);
            }
        }
        Ok(())
    }

    /// How long the step ran, if it has started and finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
