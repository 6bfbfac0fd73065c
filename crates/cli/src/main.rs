use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use stepflow_core::workflow::parser;
use stepflow_core::ExecutionId;

mod config;
mod http;

use config::{CliConfig, Runtime};

#[derive(Parser, Debug)]
#[command(name = "stepflow")]
#[command(about = "Stepflow - DAG workflow orchestration for agent pipelines", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stepflow.toml")]
    config: PathBuf,

    /// Data directory for state, events and definitions
    #[arg(short, long, env = "STEPFLOW_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a definition file and print its step graph
    Validate { file: PathBuf },

    /// Execute the latest revision of a workflow
    Run {
        /// Workflow id or name
        workflow: String,

        /// Execution input as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,

        #[arg(short, long, env = "STEPFLOW_USER", default_value = "cli")]
        user: String,
    },

    /// Show an execution and its recovery point
    Status { execution_id: String },

    Pause { execution_id: String },

    /// Continue a paused execution or recover an interrupted one
    Resume { execution_id: String },

    Cancel { execution_id: String },
}

#[derive(Serialize)]
struct GraphSummary<'a> {
    name: &'a str,
    version: &'a str,
    steps: usize,
    edges: usize,
    entry_step: &'a str,
    order: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepflow=info".into()),
        )
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Command::Validate { file } = &args.command {
        return validate(file);
    }

    let config = CliConfig::load(&args.config, args.data_dir)?;
    tracing::info!("Data directory: {}", config.data_dir.display());
    let runtime = Runtime::new(&config).await?;
    let executor = &runtime.executor;

    match args.command {
        Command::Validate { .. } => {}
        Command::Run {
            workflow,
            input,
            user,
        } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input is not valid JSON")?;
            let outcome = executor.execute(&workflow, input, &user).await?;
            runtime.event_log.flush_all().await?;
            print_json(&outcome)?;
        }
        Command::Status { execution_id } => {
            let id = execution_id_arg(&execution_id)?;
            let execution = executor
                .get_execution(&id)
                .await?
                .with_context(|| format!("Execution not found: {}", id))?;
            let recovery = executor.state().recover(&id).await?;
            print_json(&serde_json::json!({
                "execution": execution,
                "recovery": recovery,
            }))?;
        }
        Command::Pause { execution_id } => {
            let id = execution_id_arg(&execution_id)?;
            let paused = executor.pause(&id).await?;
            println!("{}", if paused { "paused" } else { "not running" });
        }
        Command::Resume { execution_id } => {
            let id = execution_id_arg(&execution_id)?;
            let outcome = executor.resume(&id).await?;
            runtime.event_log.flush_all().await?;
            print_json(&outcome)?;
        }
        Command::Cancel { execution_id } => {
            let id = execution_id_arg(&execution_id)?;
            let cancelled = executor.cancel(&id).await?;
            runtime.event_log.flush_all().await?;
            println!("{}", if cancelled { "cancelled" } else { "already finished" });
        }
    }

    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let parsed = parser::parse_str(&text)?;

    let summary = GraphSummary {
        name: parsed.name(),
        version: &parsed.definition().version,
        steps: parsed.steps().len(),
        edges: parsed.dag().edge_count(),
        entry_step: parsed.entry_step().id.as_str(),
        order: parsed
            .dag()
            .topological_order()
            .map(|ids| ids.into_iter().map(|id| id.to_string()).collect()),
    };
    print_json(&summary)
}

fn execution_id_arg(raw: &str) -> Result<ExecutionId> {
    ExecutionId::parse(raw).with_context(|| format!("Invalid execution id: {}", raw))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
