//! The agent boundary.
//!
//! An agent is anything that implements a single capability:
//! `execute(input) -> output`. The orchestration core treats it as an
//! opaque, potentially slow, potentially failing black box and applies the
//! timeout and cancellation policy from outside.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::step::{ExecutionId, StepKind};
use crate::workflow::WorkflowId;
use crate::{clog_debug, Result};

/// Failure reported by an agent.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("{0}")]
    Failed(String),

    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent was cancelled")]
    Cancelled,

    #[error("agent produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("agent IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-execution context handed to an agent.
///
/// The cancellation token fires when the execution is cancelled or the
/// manager shuts down. Agents holding external resources should watch it.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub kind: StepKind,
    cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        kind: StepKind,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow_id,
            execution_id,
            kind,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the execution has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: AgentContext,
    ) -> std::result::Result<serde_json::Value, AgentError>;
}

/// Maps each step kind to the agent that performs it.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<StepKind, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, kind: StepKind, agent: Arc<dyn Agent>) -> Self {
        self.register(kind, agent);
        self
    }

    /// Register an agent, replacing any previous one for the kind.
    pub fn register(&mut self, kind: StepKind, agent: Arc<dyn Agent>) {
        self.agents.insert(kind, agent);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.agents.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<_> = self.agents.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Build a registry of [`CommandAgent`]s from the `[agents]` config table.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (name, command) in &config.agents {
            let kind: StepKind = name.parse()?;
            clog_debug!("AgentRegistry: {} -> {}", kind, command);
            registry.register(kind, Arc::new(CommandAgent::new(command)));
        }
        Ok(registry)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Runs an external command as an agent.
///
/// The step input is written to stdin as JSON. Stdout is parsed as JSON
/// when possible and otherwise returned as a string. The child process is
/// killed when the execution is cancelled or the future is dropped.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    base_command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn binary(&self) -> Option<&str> {
        self.base_command.first().map(|s| s.as_str())
    }

    pub fn command(&self) -> &[String] {
        &self.base_command
    }

    fn parse_stdout(stdout: &str) -> serde_json::Value {
        let trimmed = stdout.trim();
        serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: AgentContext,
    ) -> std::result::Result<serde_json::Value, AgentError> {
        let (program, args) = self
            .base_command
            .split_first()
            .ok_or_else(|| AgentError::Failed("empty agent command".to_string()))?;

        let stdin_bytes =
            serde_json::to_vec(&input).map_err(|e| AgentError::InvalidOutput(e.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .env("CONDUCTOR_WORKFLOW_ID", ctx.workflow_id.to_string())
            .env("CONDUCTOR_EXECUTION_ID", ctx.execution_id.to_string())
            .env("CONDUCTOR_STEP", ctx.kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&stdin_bytes).await {
                clog_debug!("CommandAgent: stdin write failed for {}: {}", program, e);
            }
        }

        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(AgentError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    program,
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(AgentError::Failed(message));
        }

        Ok(Self::parse_stdout(&stdout))
    }
}
