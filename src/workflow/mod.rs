//! Workflow records: one per pipeline run.
//!
//! The execution store owns these rows; the orchestration layer only asks
//! it for status transitions.

mod types;

pub use types::{WorkflowExecution, WorkflowId, WorkflowKind, WorkflowStatus};
