//! Orchestration core: bounded agent execution, the message bus, and
//! resume decisions for failed workflows.

mod bus;
mod handle;
mod manager;
mod resume;
mod runner;

pub use bus::{BusConfig, CorrelationId, Message, MessageBus, MessageId, MessageType};
pub use handle::{AgentHandle, AgentId, ExecutionSlot, SlotGuard, StepFailure};
pub use manager::{AgentExecutionManager, CleanupTask, ExecutionEvent, ManagerConfig, ManagerStats};
pub use resume::{
    reset_workflow_for_resume, DefaultResumePolicy, ResumeCalculator, ResumePolicy, ResumeReport,
    SequencePolicy,
};
pub use runner::WorkflowRunner;
