//! In-memory tracking for active and recently settled step executions.
//!
//! An [`AgentHandle`] is a transient projection used only by the execution
//! manager; the step execution row in the store stays the durable source
//! of truth. [`ExecutionSlot`] is one unit of the manager's concurrency
//! bound and is released exactly once no matter how the execution ends.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::step::{ExecutionId, StepKind, StepStatus};
use crate::workflow::WorkflowId;
use crate::Error;

/// Identifier of an agent handle, returned by `spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Why a step execution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    /// The agent ran past the manager's timeout.
    Timeout(String),
    /// The agent returned an error or panicked.
    Agent(String),
    /// The execution was cancelled or the manager shut down.
    Killed,
}

impl StepFailure {
    pub fn message(&self) -> String {
        match self {
            StepFailure::Timeout(msg) | StepFailure::Agent(msg) => msg.clone(),
            StepFailure::Killed => "killed".to_string(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl From<StepFailure> for Error {
    fn from(failure: StepFailure) -> Self {
        match failure {
            StepFailure::Timeout(msg) => Error::AgentTimeout(msg),
            other => Error::AgentExecution(other.message()),
        }
    }
}

/// Snapshot of one tracked execution.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub id: AgentId,
    pub kind: StepKind,
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub status: StepStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<StepFailure>,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
}

impl AgentHandle {
    pub fn new(
        id: AgentId,
        kind: StepKind,
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id,
            kind,
            workflow_id,
            execution_id,
            status: StepStatus::Pending,
            input,
            output: None,
            error: None,
            started_at: Instant::now(),
            completed_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to Running; ignored once the handle has moved past Pending.
    pub fn mark_running(&mut self) {
        if self.status.can_transition(StepStatus::Running) {
            self.status = StepStatus::Running;
        }
    }

    /// Record the terminal outcome. Returns false if already settled.
    pub fn settle(&mut self, outcome: &Result<serde_json::Value, StepFailure>) -> bool {
        if self.is_settled() {
            return false;
        }
        match outcome {
            Ok(output) => {
                self.status = StepStatus::Completed;
                self.output = Some(output.clone());
            }
            Err(failure) => {
                self.status = StepStatus::Failed;
                self.error = Some(failure.clone());
            }
        }
        self.completed_at = Some(Instant::now());
        true
    }

    /// The stored result for a settled handle.
    pub fn outcome(&self) -> Option<Result<serde_json::Value, StepFailure>> {
        match self.status {
            StepStatus::Completed => Some(Ok(self.output.clone().unwrap_or_default())),
            StepStatus::Failed => Some(Err(self
                .error
                .clone()
                .unwrap_or_else(|| StepFailure::Agent("unknown error".to_string())))),
            _ => None,
        }
    }

    /// Whether the handle settled at least `retention` before `now`.
    pub fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        self.completed_at
            .map(|done| now.saturating_duration_since(done) >= retention)
            .unwrap_or(false)
    }
}

/// One reserved unit of the manager's concurrency bound.
///
/// Cloning shares the reservation; [`ExecutionSlot::release`] gives it back
/// at most once across all clones.
#[derive(Debug, Clone)]
pub struct ExecutionSlot {
    counter: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl ExecutionSlot {
    /// Reserve a slot if fewer than `max` are taken.
    pub fn try_acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < max).then_some(running + 1)
            })
            .ok()
            .map(|_| Self {
                counter: Arc::clone(counter),
                released: Arc::new(AtomicBool::new(false)),
            })
    }

    /// Give the slot back. Returns true only for the call that released it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.counter.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Releases the wrapped slot when dropped, covering every exit path of
/// the execution body including panics and early returns.
#[derive(Debug)]
pub struct SlotGuard(ExecutionSlot);

impl SlotGuard {
    pub fn new(slot: ExecutionSlot) -> Self {
        Self(slot)
    }

    pub fn slot(&self) -> &ExecutionSlot {
        &self.0
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Shared between the handle table and the running execution body.
#[derive(Debug)]
pub(crate) struct ExecutionControl {
    pub(crate) slot: ExecutionSlot,
    pub(crate) cancel: CancellationToken,
    settled: AtomicBool,
}

impl ExecutionControl {
    pub(crate) fn new(slot: ExecutionSlot, cancel: CancellationToken) -> Self {
        Self {
            slot,
            cancel,
            settled: AtomicBool::new(false),
        }
    }

    /// Claim the right to write the terminal state. Only the first caller wins.
    pub(crate) fn claim(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}
