//! Task DAG Scheduler entry point: bootstraps config/telemetry and runs a
//! small built-in demo DAG so `cargo run` has something to show.

use anyhow::Result;
use taskdag_common::{telemetry, Config};
use taskdag_core::{Graph, Task};
use taskdag_scheduler::{Scheduler, SchedulerContext};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

    if let Err(errors) = config.validate() {
        for error in errors {
            eprintln!("config error: {error}");
        }
        std::process::exit(1);
    }

    telemetry::init_telemetry(&config.observability)?;
    info!("starting Task DAG Scheduler v{}", env!("CARGO_PKG_VERSION"));

    let mut graph = Graph::new("demo", "fetch-build-deploy", config.dag.clone());
    graph.add_task(Task::shell("fetch", "fetch", "echo fetched"))?;
    graph.add_task(
        Task::shell("build", "build", "echo built").with_dependencies(vec!["fetch".to_string()]),
    )?;
    graph.add_task(
        Task::shell("deploy", "deploy", "echo deployed").with_dependencies(vec!["build".to_string()]),
    )?;

    let scheduler = Scheduler::new(config.scheduler.clone());
    scheduler.events().on_event(|event| {
        info!(kind = ?event.kind, task_id = ?event.task_id, "event");
    });

    let summary = scheduler.execute(graph, SchedulerContext::default()).await?;
    info!(
        success = summary.success,
        completed = summary.completed_tasks,
        failed = summary.failed_tasks,
        duration_ms = summary.total_duration_ms,
        "demo run finished"
    );

    Ok(())
}
