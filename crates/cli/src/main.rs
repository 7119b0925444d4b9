//! Thin CLI for manual construction/execution of a task DAG, printing
//! events to stdout as they happen. Not a product surface — a debugging
//! aid, same role the teacher's `meta-ai-cli` played for its orchestrator.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskdag_common::{telemetry, Config};
use taskdag_core::{DagSnapshot, Graph};
use taskdag_scheduler::{Scheduler, SchedulerContext};
use tracing::info;

#[derive(Parser)]
#[command(name = "taskdag-cli", version, about = "Task DAG Scheduler CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a DAG snapshot file without executing it.
    Validate {
        /// Path to a JSON-encoded `DagSnapshot`.
        file: PathBuf,
    },
    /// Execute a DAG snapshot, printing events to stdout as they happen.
    Run {
        /// Path to a JSON-encoded `DagSnapshot`.
        file: PathBuf,
    },
}

fn load_graph(file: &PathBuf) -> Result<Graph> {
    let contents = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let snapshot: DagSnapshot =
        serde_json::from_str(&contents).with_context(|| format!("parsing {} as a DAG snapshot", file.display()))?;
    Ok(Graph::from_snapshot(snapshot))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
    telemetry::init_telemetry(&config.observability)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let graph = load_graph(&file)?;
            let result = graph.validate();
            if result.valid {
                println!("valid: {} task(s)", graph.task_count());
            } else {
                for error in &result.errors {
                    println!("error: {error}");
                }
                std::process::exit(1);
            }
            for warning in &result.warnings {
                println!("warning: {warning}");
            }
        }
        Commands::Run { file } => {
            let graph = load_graph(&file)?;

            let scheduler = Scheduler::new(config.scheduler.clone());
            scheduler.events().on_event(|event| {
                println!("{} {:?} {:?}", event.timestamp.to_rfc3339(), event.kind, event.task_id);
            });

            let summary = scheduler.execute(graph, SchedulerContext::default()).await?;
            info!(
                success = summary.success,
                completed = summary.completed_tasks,
                failed = summary.failed_tasks,
                "run complete"
            );

            if !summary.success {
                for error in &summary.errors {
                    eprintln!("task {} failed: {}", error.task_id, error.message);
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
