use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor::agent::AgentRegistry;
use conductor::config::Config;
use conductor::orchestration::{AgentExecutionManager, ResumeCalculator, WorkflowRunner};
use conductor::step::StepStatus;
use conductor::store::{ExecutionStore, JsonFileStore};
use conductor::workflow::{WorkflowExecution, WorkflowId, WorkflowKind, WorkflowStatus};
use conductor::{clog, Error, Result};

/// Conductor - bounded, resumable multi-step agent workflows
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a new workflow with the configured agents
    Run {
        /// Workflow kind: feature, bugfix, refactor or documentation
        kind: WorkflowKind,

        /// JSON payload handed to every step
        #[arg(long, short = 'p')]
        payload: Option<String>,

        /// Branch or free-form label
        #[arg(long, short = 'l')]
        label: Option<String>,
    },

    /// Resume a failed workflow from its last completed step
    Resume {
        /// Workflow ID
        workflow_id: String,
    },

    /// Show a workflow and its step executions
    Status {
        /// Workflow ID
        workflow_id: String,
    },

    /// List recorded workflows
    List,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init(cli.debug);
    clog!("conductor starting: {:?}", cli.command);

    let config = Config::load()?;
    match cli.command {
        Command::Run {
            kind,
            payload,
            label,
        } => run_workflow(&config, kind, payload, label),
        Command::Resume { workflow_id } => run_resume(&config, &workflow_id),
        Command::Status { workflow_id } => run_status(&config, &workflow_id),
        Command::List => run_list(&config),
        Command::Config => run_config(&config),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

async fn open_store(config: &Config) -> Result<Arc<JsonFileStore>> {
    Ok(Arc::new(JsonFileStore::open(config.effective_state_path()?).await?))
}

fn build_runner(config: &Config, store: Arc<JsonFileStore>) -> Result<WorkflowRunner> {
    let registry = AgentRegistry::from_config(config)?;
    let manager = AgentExecutionManager::new(store, registry, config.manager_config());
    Ok(WorkflowRunner::new(manager, ResumeCalculator::default()))
}

fn parse_workflow_id(s: &str) -> Result<WorkflowId> {
    s.parse()
        .map_err(|_| Error::Validation(format!("invalid workflow id: {}", s)))
}

fn parse_payload(payload: Option<String>) -> Result<serde_json::Value> {
    match payload {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(serde_json::Value::Null),
    }
}

fn run_workflow(
    config: &Config,
    kind: WorkflowKind,
    payload: Option<String>,
    label: Option<String>,
) -> Result<()> {
    let payload = parse_payload(payload)?;
    let rt = build_runtime()?;
    rt.block_on(async {
        let store = open_store(config).await?;
        let runner = build_runner(config, Arc::clone(&store))?;
        let cleanup = runner.manager().start_cleanup_task();

        let id = runner.create(kind, payload, label).await?;
        println!("Workflow {} ({}) started", id.short(), kind);

        let result = runner.run(id).await;
        cleanup.stop();
        runner.manager().shutdown().await;

        report_outcome(store.as_ref(), id, result).await
    })
}

fn run_resume(config: &Config, workflow_id: &str) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    let rt = build_runtime()?;
    rt.block_on(async {
        let store = open_store(config).await?;
        let runner = build_runner(config, Arc::clone(&store))?;

        let workflow = load_workflow(store.as_ref(), id).await?;
        let steps = store.list_step_executions(id).await?;
        let report = runner.calculator().analyze(&workflow, &steps);
        let sequence = runner.calculator().sequence(workflow.kind);

        println!();
        println!("  Workflow:    {}", id.short());
        println!("  Status:      {}", format_status(workflow.status));
        println!("  Resumable:   {}", report.resumable);
        if let Some(reason) = &report.reason {
            println!("  Reason:      {}", reason);
        }
        println!("  Completed:   {:?}", report.completed_kinds);
        if let Some(failed) = &report.failed {
            println!(
                "  Failed:      {} ({})",
                failed.kind,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }
        println!("  Remaining:   {:?}", report.remaining(sequence));
        println!();

        if !report.resumable {
            return Ok(());
        }

        let cleanup = runner.manager().start_cleanup_task();
        let result = runner.resume(id).await;
        cleanup.stop();
        runner.manager().shutdown().await;

        report_outcome(store.as_ref(), id, result).await
    })
}

fn run_status(config: &Config, workflow_id: &str) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    let rt = build_runtime()?;
    rt.block_on(async {
        let store = open_store(config).await?;
        let workflow = load_workflow(store.as_ref(), id).await?;
        let steps = store.list_step_executions(id).await?;

        println!();
        println!("  ID:          {}", workflow.id);
        println!("  Kind:        {}", workflow.kind);
        println!("  Status:      {}", format_status(workflow.status));
        if let Some(label) = &workflow.label {
            println!("  Label:       {}", label);
        }
        println!(
            "  Created:     {}",
            workflow.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(done) = workflow.completed_at {
            println!("  Completed:   {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        println!();

        if steps.is_empty() {
            println!("  No step executions recorded");
            return Ok(());
        }

        println!(
            "  {:<10} {:<14} {:<10} {:>5} {:>10}  ERROR",
            "EXECUTION", "STEP", "STATUS", "RETRY", "DURATION"
        );
        for step in steps {
            let duration = step
                .duration()
                .map(|d| format!("{}ms", d.num_milliseconds()))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<10} {:<14} {:<10} {:>5} {:>10}  {}",
                step.id.short(),
                step.kind,
                format_step_status(step.status),
                step.retry_count,
                duration,
                truncate_string(step.error.as_deref().unwrap_or(""), 40)
            );
        }
        Ok(())
    })
}

fn run_list(config: &Config) -> Result<()> {
    let rt = build_runtime()?;
    rt.block_on(async {
        let store = open_store(config).await?;
        let workflows = store.list_workflows().await?;
        if workflows.is_empty() {
            println!("No workflows recorded");
            return Ok(());
        }

        println!(
            "{:<10} {:<14} {:<12} {:<20} LABEL",
            "ID", "KIND", "STATUS", "CREATED"
        );
        for workflow in workflows {
            println!(
                "{:<10} {:<14} {:<12} {:<20} {}",
                workflow.id.short(),
                workflow.kind,
                workflow.status,
                workflow.created_at.format("%Y-%m-%d %H:%M:%S"),
                workflow.label.as_deref().unwrap_or("-")
            );
        }
        Ok(())
    })
}

fn run_config(config: &Config) -> Result<()> {
    println!("# {}", Config::config_path()?.display());
    print!("{}", toml::to_string_pretty(config)?);
    println!("# state: {}", config.effective_state_path()?.display());
    Ok(())
}

async fn load_workflow(store: &dyn ExecutionStore, id: WorkflowId) -> Result<WorkflowExecution> {
    store
        .get_workflow(id)
        .await?
        .ok_or(Error::WorkflowNotFound(id))
}

async fn report_outcome(
    store: &dyn ExecutionStore,
    id: WorkflowId,
    result: Result<WorkflowExecution>,
) -> Result<()> {
    match result {
        Ok(workflow) => {
            println!(
                "Workflow {} finished: {}",
                workflow.id.short(),
                format_status(workflow.status)
            );
            Ok(())
        }
        Err(e) => {
            let status = store
                .get_workflow(id)
                .await?
                .map(|w| w.status)
                .unwrap_or(WorkflowStatus::Failed);
            println!("Workflow {} finished: {}", id.short(), format_status(status));
            println!("  Error: {}", e);
            println!("  Resume with: conductor resume {}", id);
            Err(e)
        }
    }
}

fn format_status(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        WorkflowStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        WorkflowStatus::InProgress => format!("\x1b[33m{}\x1b[0m", status),
        WorkflowStatus::Cancelled => format!("\x1b[35m{}\x1b[0m", status),
        WorkflowStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),
    }
}

fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Completed => "completed".to_string(),
        StepStatus::Failed => "FAILED".to_string(),
        other => other.to_string(),
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
