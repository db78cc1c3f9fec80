//! Core workflow type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of pipeline a workflow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Feature,
    Bugfix,
    Refactor,
    Documentation,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 4] = [
        WorkflowKind::Feature,
        WorkflowKind::Bugfix,
        WorkflowKind::Refactor,
        WorkflowKind::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Feature => "feature",
            WorkflowKind::Bugfix => "bugfix",
            WorkflowKind::Refactor => "refactor",
            WorkflowKind::Documentation => "documentation",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::Validation(format!("unknown workflow kind: {}", s)))
    }
}

/// Status of a workflow in its lifecycle.
///
/// Pending -> InProgress -> {Completed, Failed, Cancelled}. Terminal
/// states never move again through [`WorkflowStatus::can_transition`];
/// resuming a failed workflow goes through the store's explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        matches!(
            (self, target),
            (WorkflowStatus::Pending, WorkflowStatus::InProgress)
                | (WorkflowStatus::Pending, WorkflowStatus::Failed)
                | (WorkflowStatus::Pending, WorkflowStatus::Cancelled)
                | (WorkflowStatus::InProgress, WorkflowStatus::Completed)
                | (WorkflowStatus::InProgress, WorkflowStatus::Failed)
                | (WorkflowStatus::InProgress, WorkflowStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::InProgress => write!(f, "in_progress"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One pipeline run, owned by the execution store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: WorkflowId,
    pub kind: WorkflowKind,
    pub status: WorkflowStatus,
    /// Arbitrary structured input for the whole run.
    pub payload: serde_json::Value,
    /// Branch or free-form label.
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(kind: WorkflowKind, payload: serde_json::Value, label: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            kind,
            status: WorkflowStatus::Pending,
            payload,
            label,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply a forward status transition.
    ///
    /// Re-applying the current status only refreshes the label.
    pub fn transition(
        &mut self,
        target: WorkflowStatus,
        label: Option<String>,
    ) -> crate::Result<()> {
        if self.status != target && !self.status.can_transition(target) {
            return Err(crate::Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        let now = Utc::now();
        self.status = target;
        self.updated_at = now;
        if label.is_some() {
            self.label = label;
        }
        if target.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Put a failed workflow back to Pending so it can be resumed.
    pub fn reset_for_resume(&mut self) -> crate::Result<()> {
        if self.status != WorkflowStatus::Failed {
            return Err(crate::Error::InvalidTransition {
                from: self.status.to_string(),
                to: WorkflowStatus::Pending.to_string(),
            });
        }
        self.status = WorkflowStatus::Pending;
        self.updated_at = Utc::now();
        self.completed_at = None;
        Ok(())
    }
}
