//! Bounded-concurrency orchestration for multi-step agent workflows.
//!
//! - [`orchestration::AgentExecutionManager`] runs step executions under a
//!   concurrency bound and a timeout, recording every transition in an
//!   [`store::ExecutionStore`].
//! - [`orchestration::MessageBus`] gives agents point-to-point, request and
//!   broadcast messaging.
//! - [`orchestration::ResumeCalculator`] decides whether a failed workflow
//!   can resume and where.

pub mod agent;
pub mod config;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod step;
pub mod store;
pub mod util;
pub mod workflow;

pub use error::{Error, Result};
