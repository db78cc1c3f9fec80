//! Resume decisions for failed workflows.
//!
//! [`ResumeCalculator::analyze`] is pure: it inspects a workflow's step
//! history and reports whether the workflow may resume and at which offset
//! of its canonical step sequence. [`reset_workflow_for_resume`] is the
//! separate, side-effecting step that flips a resumable workflow back to
//! Pending.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::step::{StepExecution, StepKind, StepStatus};
use crate::store::ExecutionStore;
use crate::workflow::{WorkflowExecution, WorkflowId, WorkflowKind, WorkflowStatus};
use crate::{clog, clog_debug, Error, Result};

/// Which steps a workflow runs, and which of them count as progress.
pub trait ResumePolicy: Send + Sync {
    fn canonical_sequence(&self, kind: WorkflowKind) -> &[StepKind];

    fn counts_as_progress(&self, kind: StepKind) -> bool;
}

const FULL_PIPELINE: [StepKind; 6] = [
    StepKind::Plan,
    StepKind::Code,
    StepKind::SecurityLint,
    StepKind::Test,
    StepKind::Review,
    StepKind::Document,
];

const DOCS_PIPELINE: [StepKind; 2] = [StepKind::Plan, StepKind::Document];

/// Built-in pipelines. Orchestrator rows never count as progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResumePolicy;

impl ResumePolicy for DefaultResumePolicy {
    fn canonical_sequence(&self, kind: WorkflowKind) -> &[StepKind] {
        match kind {
            WorkflowKind::Documentation => &DOCS_PIPELINE,
            WorkflowKind::Feature | WorkflowKind::Bugfix | WorkflowKind::Refactor => {
                &FULL_PIPELINE
            }
        }
    }

    fn counts_as_progress(&self, kind: StepKind) -> bool {
        kind != StepKind::Orchestrator
    }
}

/// One explicit sequence for every workflow kind.
#[derive(Debug, Clone)]
pub struct SequencePolicy {
    sequence: Vec<StepKind>,
    excluded: Vec<StepKind>,
}

impl SequencePolicy {
    pub fn new(sequence: Vec<StepKind>, excluded: Vec<StepKind>) -> Self {
        Self { sequence, excluded }
    }
}

impl ResumePolicy for SequencePolicy {
    fn canonical_sequence(&self, _kind: WorkflowKind) -> &[StepKind] {
        &self.sequence
    }

    fn counts_as_progress(&self, kind: StepKind) -> bool {
        !self.excluded.contains(&kind)
    }
}

/// Outcome of analysing a workflow's step history.
#[derive(Debug, Clone)]
pub struct ResumeReport {
    pub workflow_id: WorkflowId,
    pub resumable: bool,
    /// Why the workflow cannot resume; `None` when it can.
    pub reason: Option<String>,
    pub completed: Vec<StepExecution>,
    /// The most recent failed attempt.
    pub failed: Option<StepExecution>,
    /// Pending rows, plus Running rows left over from an interrupted run.
    pub pending: Vec<StepExecution>,
    pub resume_offset: usize,
    /// Distinct completed kinds that count as progress, in first-seen order.
    pub completed_kinds: Vec<StepKind>,
}

impl ResumeReport {
    /// Steps of `sequence` still to run.
    pub fn remaining<'a>(&self, sequence: &'a [StepKind]) -> &'a [StepKind] {
        &sequence[self.resume_offset.min(sequence.len())..]
    }
}

#[derive(Clone)]
pub struct ResumeCalculator {
    policy: Arc<dyn ResumePolicy>,
}

impl Default for ResumeCalculator {
    fn default() -> Self {
        Self::new(Arc::new(DefaultResumePolicy))
    }
}

impl ResumeCalculator {
    pub fn new(policy: Arc<dyn ResumePolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &dyn ResumePolicy {
        self.policy.as_ref()
    }

    pub fn sequence(&self, kind: WorkflowKind) -> &[StepKind] {
        self.policy.canonical_sequence(kind)
    }

    /// Decide whether `workflow` can resume and from where.
    pub fn analyze(&self, workflow: &WorkflowExecution, steps: &[StepExecution]) -> ResumeReport {
        let mut completed = Vec::new();
        let mut failed: Option<StepExecution> = None;
        let mut pending = Vec::new();

        for step in steps.iter().filter(|s| s.workflow_id == workflow.id) {
            match step.status {
                StepStatus::Completed => completed.push(step.clone()),
                StepStatus::Failed => {
                    let newer = failed
                        .as_ref()
                        .map(|f| failure_time(step) >= failure_time(f))
                        .unwrap_or(true);
                    if newer {
                        failed = Some(step.clone());
                    }
                }
                StepStatus::Pending | StepStatus::Running => pending.push(step.clone()),
            }
        }

        let mut seen = BTreeSet::new();
        let completed_kinds: Vec<StepKind> = completed
            .iter()
            .map(|s| s.kind)
            .filter(|k| self.policy.counts_as_progress(*k))
            .filter(|k| seen.insert(*k))
            .collect();

        let reason = if workflow.status != WorkflowStatus::Failed {
            Some(format!("workflow status is {}, not failed", workflow.status))
        } else if completed.is_empty() {
            Some("no step has completed".to_string())
        } else if completed_kinds.is_empty() {
            Some("only orchestration steps have completed".to_string())
        } else {
            None
        };

        let sequence = self.policy.canonical_sequence(workflow.kind);
        let resume_offset = sequence
            .iter()
            .rposition(|k| completed_kinds.contains(k))
            .map(|last| last + 1)
            .unwrap_or(0);

        clog_debug!(
            "resume analysis workflow={} resumable={} offset={}/{} completed={:?}",
            workflow.id.short(),
            reason.is_none(),
            resume_offset,
            sequence.len(),
            completed_kinds
        );

        ResumeReport {
            workflow_id: workflow.id,
            resumable: reason.is_none(),
            reason,
            completed,
            failed,
            pending,
            resume_offset,
            completed_kinds,
        }
    }
}

fn failure_time(step: &StepExecution) -> chrono::DateTime<chrono::Utc> {
    step.completed_at.unwrap_or(step.created_at)
}

/// Analyse `workflow_id` and, if it may resume, set it back to Pending.
pub async fn reset_workflow_for_resume(
    store: &dyn ExecutionStore,
    calculator: &ResumeCalculator,
    workflow_id: WorkflowId,
) -> Result<ResumeReport> {
    let workflow = store
        .get_workflow(workflow_id)
        .await?
        .ok_or(Error::WorkflowNotFound(workflow_id))?;
    let steps = store.list_step_executions(workflow_id).await?;

    let report = calculator.analyze(&workflow, &steps);
    if let Some(reason) = &report.reason {
        clog!("workflow={} not resumable: {}", workflow_id.short(), reason);
        return Err(Error::ResumeNotAllowed {
            workflow_id,
            reason: reason.clone(),
        });
    }

    store.reset_workflow(workflow_id).await?;
    clog!(
        "workflow={} reset for resume at offset {}",
        workflow_id.short(),
        report.resume_offset
    );
    Ok(report)
}
