//! The scheduler loop (C5): bounded-parallelism dispatch, pause/resume,
//! global cancel, output passing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use taskdag_common::{Error, Result, SchedulerConfig};
use taskdag_core::{
    readiness::get_ready_tasks, readiness::propagate_failure, readiness::FailureEffect, DagStatus, Event,
    EventBus, EventKind, Graph, Task, TaskFailure, TaskId, TaskOutput, TaskStatus,
};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::context::{SchedulerContext, TaskExecutionContext};
use crate::executor::{CheckpointExecutor, Executor, ExecutorRegistry, ShellExecutor};

/// Per-task-id error surfaced on `ExecutionSummary` for critical failures.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub task_id: TaskId,
    pub message: String,
}

/// Return value of `Scheduler::execute` (§6 Execution API).
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub success: bool,
    pub dag: Graph,
    pub total_duration_ms: i64,
    pub max_parallelism: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub errors: Vec<TaskError>,
}

enum TaskOutcome {
    Completed(TaskOutput),
    Failed(TaskFailure),
    Cancelled,
}

struct TaskResult {
    task_id: TaskId,
    outcome: TaskOutcome,
}

/// Shared control flags reachable from any cloned `Scheduler` handle, so a
/// caller can clone the scheduler before spawning `execute()` and call
/// `pause`/`resume`/`cancel` concurrently from another task (literal
/// scenario: cancel 200ms after execute starts).
struct ControlState {
    running: AtomicBool,
    paused: AtomicBool,
    resume_notify: Notify,
    cancel_token: CancellationToken,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            cancel_token: CancellationToken::new(),
        }
    }
}

/// Coordinates execution of a [`Graph`]. Cheap to `Clone` — all mutable
/// state is `Arc`-shared — but only one `execute()` call should run a given
/// scheduler's graph at a time; the graph itself is passed by value into
/// `execute` and is not shared concurrently (§5, §9).
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    executors: Arc<RwLock<ExecutorRegistry>>,
    events: EventBus,
    control: Arc<ControlState>,
    output_cache: Arc<DashMap<TaskId, TaskOutput>>,
    running_tasks: Arc<DashMap<TaskId, CancellationToken>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let mut registry = ExecutorRegistry::new();
        registry.register("shell", Arc::new(ShellExecutor));
        registry.register("checkpoint", Arc::new(CheckpointExecutor));

        Self {
            config,
            executors: Arc::new(RwLock::new(registry)),
            events: EventBus::new(),
            control: Arc::new(ControlState::default()),
            output_cache: Arc::new(DashMap::new()),
            running_tasks: Arc::new(DashMap::new()),
        }
    }

    pub fn register_executor(&self, type_name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.write().register(type_name, executor);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn emit_progress(&self, graph: &Graph) {
        let stats = graph.statistics(self.config.max_parallelism);
        self.events
            .emit(Event::dag(EventKind::ProgressUpdate, &graph.id, serde_json::to_value(&stats).ok()));
    }

    /// Drives `graph` to a terminal status. Validation errors fail fast
    /// before any task starts (§7).
    #[instrument(skip(self, graph, sched_ctx), fields(dag_id = %graph.id))]
    pub async fn execute(&self, mut graph: Graph, sched_ctx: SchedulerContext) -> Result<ExecutionSummary> {
        let validation = graph.validate();
        if !validation.valid {
            return Err(Error::Validation(validation.errors.join("; ")));
        }

        self.control.running.store(true, Ordering::SeqCst);
        self.control.paused.store(false, Ordering::SeqCst);
        self.output_cache.clear();

        graph.status = DagStatus::Running;
        graph.started_at = Some(Utc::now());
        self.events.emit(Event::dag(EventKind::DagStart, &graph.id, None));
        self.emit_progress(&graph);

        let (result_tx, mut result_rx) = mpsc::channel::<TaskResult>(256);
        let mut active: HashMap<TaskId, ()> = HashMap::new();
        let schedule_interval = Duration::from_millis(self.config.schedule_interval_ms);

        loop {
            if graph.is_complete() || !self.control.running.load(Ordering::SeqCst) {
                break;
            }

            if self.control.paused.load(Ordering::SeqCst) {
                if graph.status != DagStatus::Paused {
                    graph.status = DagStatus::Paused;
                    self.events.emit(Event::dag(EventKind::DagPaused, &graph.id, None));
                }
                // `notify_waiters` stores no permit, so a `resume()` landing between the
                // `paused.load()` above and this `.notified()` registration would otherwise
                // be lost forever; the `schedule_interval` tick bounds the wait so the next
                // loop iteration always re-checks the flag and self-heals.
                tokio::select! {
                    _ = self.control.resume_notify.notified() => {}
                    _ = self.control.cancel_token.cancelled() => {}
                    _ = tokio::time::sleep(schedule_interval) => {}
                }
                if !self.control.paused.load(Ordering::SeqCst) && graph.status == DagStatus::Paused {
                    graph.status = DagStatus::Running;
                    self.events.emit(Event::dag(EventKind::DagResumed, &graph.id, None));
                }
                continue;
            }

            let ready = get_ready_tasks(&mut graph);
            for id in &ready.newly_ready {
                self.events.emit(Event::task(EventKind::TaskReady, &graph.id, id.clone(), None));
            }
            if !ready.newly_ready.is_empty() {
                self.emit_progress(&graph);
            }

            let slots = self.config.max_parallelism.saturating_sub(active.len());
            let to_start: Vec<TaskId> =
                ready.ready.into_iter().filter(|id| !active.contains_key(id)).take(slots).collect();

            for id in to_start {
                self.start_task(&mut graph, &id, &sched_ctx, result_tx.clone());
                active.insert(id, ());
            }

            if !active.is_empty() {
                tokio::select! {
                    Some(result) = result_rx.recv() => {
                        active.remove(&result.task_id);
                        self.apply_result(&mut graph, result);
                    }
                    _ = tokio::time::sleep(schedule_interval) => {}
                    _ = self.control.cancel_token.cancelled() => {}
                }
            } else if ready.ready.is_empty() {
                tokio::time::sleep(schedule_interval).await;
            }
        }

        if self.control.cancel_token.is_cancelled() {
            self.cancel_all_non_terminal(&mut graph);
        }

        while !active.is_empty() {
            match result_rx.recv().await {
                Some(result) => {
                    active.remove(&result.task_id);
                    self.apply_result(&mut graph, result);
                }
                None => break,
            }
        }

        self.running_tasks.clear();
        self.finalize(&mut graph)
    }

    fn cancel_all_non_terminal(&self, graph: &mut Graph) {
        let ids: Vec<TaskId> = graph.tasks().filter(|t| !t.status.is_terminal()).map(|t| t.id.clone()).collect();
        for id in ids {
            graph.cancel_task(&id).expect("task present");
            self.events.emit(Event::task(EventKind::TaskCancelled, &graph.id, id, None));
        }
    }

    fn finalize(&self, graph: &mut Graph) -> Result<ExecutionSummary> {
        let cancelled_by_caller = self.control.cancel_token.is_cancelled();
        graph.completed_at = Some(Utc::now());

        let errors: Vec<TaskError> = graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Failed && !t.allow_failure)
            .map(|t| TaskError {
                task_id: t.id.clone(),
                message: t.failure.as_ref().map(|f| f.message.clone()).unwrap_or_default(),
            })
            .collect();

        let completed_tasks = graph.tasks().filter(|t| t.status == TaskStatus::Completed).count();
        let has_critical_failure = !errors.is_empty();

        graph.status = if cancelled_by_caller {
            DagStatus::Cancelled
        } else if has_critical_failure {
            DagStatus::Failed
        } else {
            DagStatus::Completed
        };

        let terminal_event = match graph.status {
            DagStatus::Cancelled => EventKind::DagCancelled,
            DagStatus::Failed => EventKind::DagFailed,
            _ => EventKind::DagComplete,
        };
        self.events.emit(Event::dag(terminal_event, &graph.id, None));
        self.emit_progress(graph);
        self.control.running.store(false, Ordering::SeqCst);

        let total_duration_ms = match (graph.started_at, graph.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };

        Ok(ExecutionSummary {
            success: !has_critical_failure && !cancelled_by_caller,
            dag: graph.clone(),
            total_duration_ms,
            max_parallelism: self.config.max_parallelism,
            completed_tasks,
            failed_tasks: errors.len(),
            errors,
        })
    }

    /// Builds the per-task execution context, transitions to `running`, and
    /// spawns the task's executor, racing it against the task's timeout and
    /// the cancellation token (§4.5 `start(task)`).
    fn start_task(
        &self,
        graph: &mut Graph,
        id: &str,
        sched_ctx: &SchedulerContext,
        result_tx: mpsc::Sender<TaskResult>,
    ) {
        let task = graph.task(id).expect("ready task present").clone();

        if self.config.strict_dependency_check {
            if let Some(message) = self.strict_dependency_violation(graph, &task) {
                graph.start_task(id).expect("ready task can start");
                self.events.emit(Event::task(EventKind::TaskStart, &graph.id, id.to_string(), None));
                let failure = TaskFailure::non_retryable(message);
                let _ = result_tx.try_send(TaskResult { task_id: id.to_string(), outcome: TaskOutcome::Failed(failure) });
                return;
            }
        }

        let exec_ctx = self.build_execution_context(graph, &task, sched_ctx);
        let executor = self.executors.read().get(task.task_type.as_str());

        graph.start_task(id).expect("ready task can start");
        self.events.emit(Event::task(EventKind::TaskStart, &graph.id, id.to_string(), None));

        let task_token = self.control.cancel_token.child_token();
        self.running_tasks.insert(id.to_string(), task_token.clone());

        let timeout = Duration::from_millis(task.timeout_ms.unwrap_or(self.config.default_timeout_ms));
        let max_output_size = self.config.max_output_size;
        let dag_id = graph.id.clone();
        let events = self.events.clone();
        let output_cache = self.output_cache.clone();
        let running_tasks = self.running_tasks.clone();

        tokio::spawn(async move {
            let outcome = match executor {
                None => TaskOutcome::Failed(TaskFailure::non_retryable(
                    Error::NoExecutor(task.task_type.as_str().to_string()).to_string(),
                )),
                Some(executor) => {
                    run_with_timeout(executor, &task, &exec_ctx, task_token.clone(), timeout).await
                }
            };

            running_tasks.remove(&task.id);

            let outcome = match outcome {
                TaskOutcome::Completed(mut output) => {
                    if output.text.len() > max_output_size {
                        let orig = output.text.len();
                        output.text.truncate(max_output_size);
                        output
                            .text
                            .push_str(&format!("\n[Output truncated: {orig} bytes -> {max_output_size} bytes]"));
                        warn!(task_id = %task.id, orig, max_output_size, "task output truncated");
                    }
                    output_cache.insert(task.id.clone(), output.clone());
                    TaskOutcome::Completed(output)
                }
                other => other,
            };

            if matches!(outcome, TaskOutcome::Cancelled) {
                events.emit(Event::task(EventKind::TaskCancelled, &dag_id, task.id.clone(), None));
            }

            let _ = result_tx.send(TaskResult { task_id: task.id.clone(), outcome }).await;
        });
    }

    fn strict_dependency_violation(&self, graph: &Graph, task: &Task) -> Option<String> {
        let offenders: Vec<TaskId> = task
            .dependencies
            .iter()
            .filter(|dep| {
                let dep_task = graph.task(dep).expect("dependency exists");
                !Task::dependency_satisfied(dep_task.status, dep_task.allow_failure)
            })
            .cloned()
            .collect();
        if offenders.is_empty() {
            None
        } else {
            Some(format!("dependency task(s) failed: {}", offenders.join(", ")))
        }
    }

    fn build_execution_context(
        &self,
        graph: &Graph,
        task: &Task,
        sched_ctx: &SchedulerContext,
    ) -> TaskExecutionContext {
        let mut dependency_outputs = HashMap::new();
        let mut dependency_statuses = HashMap::new();
        for dep in &task.dependencies {
            if let Some(dep_task) = graph.task(dep) {
                dependency_statuses.insert(dep.clone(), dep_task.status);
            }
            if self.config.enable_output_passing {
                if let Some(output) = self.output_cache.get(dep) {
                    dependency_outputs.insert(dep.clone(), output.clone());
                } else if let Some(dep_task) = graph.task(dep) {
                    if let Some(output) = &dep_task.output {
                        dependency_outputs.insert(dep.clone(), output.clone());
                    }
                }
            }
        }

        TaskExecutionContext {
            dependency_outputs,
            dependency_statuses,
            shared_context: graph.shared_context.clone(),
            working_directory: sched_ctx.working_directory.clone(),
            remaining_budget: sched_ctx.remaining_budget,
            tool_context: sched_ctx.tool_context.clone(),
        }
    }

    /// Applies a finished task's outcome to the graph, running the
    /// appropriate §4.1/§4.4 reaction, and emits the matching events.
    fn apply_result(&self, graph: &mut Graph, result: TaskResult) {
        let TaskResult { task_id, outcome } = result;
        match outcome {
            TaskOutcome::Completed(output) => {
                graph.complete_task(&task_id, output).expect("task present");
                self.events.emit(Event::task(EventKind::TaskComplete, &graph.id, task_id.clone(), None));
                let promoted = taskdag_core::readiness::promote_dependents(graph, &task_id);
                for id in promoted {
                    self.events.emit(Event::task(EventKind::TaskReady, &graph.id, id, None));
                }
            }
            TaskOutcome::Cancelled => {
                graph.cancel_task(&task_id).expect("task present");
            }
            TaskOutcome::Failed(failure) => {
                let retried = graph.fail_task(&task_id, failure).expect("task present");
                if retried {
                    self.events.emit(Event::task(EventKind::TaskRetry, &graph.id, task_id.clone(), None));
                    self.events.emit(Event::task(EventKind::TaskReady, &graph.id, task_id, None));
                } else {
                    self.events.emit(Event::task(EventKind::TaskFailed, &graph.id, task_id.clone(), None));
                    match propagate_failure(graph, &task_id) {
                        FailureEffect::CancelAll { cancelled } => {
                            for id in cancelled {
                                self.events.emit(Event::task(EventKind::TaskCancelled, &graph.id, id, None));
                            }
                            self.events.emit(Event::dag(EventKind::DagFailed, &graph.id, None));
                        }
                        FailureEffect::Cascade { skipped, promoted } => {
                            for id in skipped {
                                self.events.emit(Event::task(EventKind::TaskSkipped, &graph.id, id, None));
                            }
                            for id in promoted {
                                self.events.emit(Event::task(EventKind::TaskReady, &graph.id, id, None));
                            }
                        }
                        FailureEffect::None => {}
                    }
                }
            }
        }
        self.emit_progress(graph);
    }

    /// Only if running and not paused (§4.5).
    pub fn pause(&self) {
        if !self.control.running.load(Ordering::SeqCst) {
            return;
        }
        if !self.control.paused.swap(true, Ordering::SeqCst) {
            info!("scheduler paused");
        }
    }

    pub fn resume(&self) {
        if self.control.paused.swap(false, Ordering::SeqCst) {
            self.control.resume_notify.notify_waiters();
            info!("scheduler resumed");
        }
    }

    /// Global hard cancel. Idempotent; a no-op if the DAG is already
    /// terminal (the coordinator loop will simply have exited already).
    pub fn cancel(&self) {
        self.control.running.store(false, Ordering::SeqCst);
        self.control.cancel_token.cancel();
        self.control.resume_notify.notify_waiters();
    }
}

async fn run_with_timeout(
    executor: Arc<dyn Executor>,
    task: &Task,
    ctx: &TaskExecutionContext,
    token: CancellationToken,
    timeout: Duration,
) -> TaskOutcome {
    let exec_fut = executor.execute(task, ctx, token.clone());
    tokio::pin!(exec_fut);

    let result = tokio::select! {
        result = &mut exec_fut => result,
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            let _ = (&mut exec_fut).await;
            return TaskOutcome::Failed(TaskFailure::non_retryable(format!(
                "task {:?} timed out after {timeout:?}",
                task.id
            )));
        }
    };

    classify_result(result, &token, task)
}

fn classify_result(
    result: Result<TaskOutput>,
    token: &CancellationToken,
    task: &Task,
) -> TaskOutcome {
    match result {
        Ok(output) => TaskOutcome::Completed(output),
        Err(Error::Cancelled(_)) => TaskOutcome::Cancelled,
        Err(err) if token.is_cancelled() => {
            let _ = err;
            TaskOutcome::Cancelled
        }
        Err(err) => {
            let retryable = err.is_retryable() && task.metadata.retry_count < task.metadata.max_retries;
            let message = match &err {
                Error::TaskFailure(message) => message.clone(),
                other => other.to_string(),
            };
            TaskOutcome::Failed(TaskFailure { message, code: None, retryable, stack: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskdag_common::DagOptions;

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig { max_parallelism: 2, ..SchedulerConfig::default() })
    }

    #[tokio::test]
    async fn linear_chain_completes_in_order() {
        let mut graph = Graph::new("g1", "chain", DagOptions::default());
        graph.add_task(Task::shell("a", "a", "echo hello")).unwrap();
        graph.add_task(Task::shell("b", "b", "echo world").with_dependencies(vec!["a".to_string()])).unwrap();

        let sched = scheduler();
        let summary = sched.execute(graph, SchedulerContext::default()).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.dag.task("a").unwrap().output.as_ref().unwrap().text.trim(), "hello");
        assert_eq!(summary.dag.task("b").unwrap().output.as_ref().unwrap().text.trim(), "world");
    }

    #[tokio::test]
    async fn fan_out_with_checkpoint_collects_outputs() {
        let mut graph = Graph::new("g2", "fanout", DagOptions::default());
        graph.add_task(Task::shell("s1", "s1", "echo 1")).unwrap();
        graph.add_task(Task::shell("s2", "s2", "echo 2")).unwrap();
        graph
            .add_task(Task::checkpoint("cp", "cp", vec!["s1".to_string(), "s2".to_string()], true, true))
            .unwrap();

        let sched = scheduler();
        let summary = sched.execute(graph, SchedulerContext::default()).await.unwrap();

        assert!(summary.success);
        let cp = summary.dag.task("cp").unwrap();
        let data = cp.output.as_ref().unwrap().data.as_ref().unwrap();
        assert!(data.get("s1").is_some());
        assert!(data.get("s2").is_some());
    }

    #[tokio::test]
    async fn fail_fast_cancels_dependents() {
        let mut opts = DagOptions::default();
        opts.failure_strategy = taskdag_common::FailureStrategy::FailFast;
        let mut graph = Graph::new("g3", "failfast", opts);
        graph.add_task(Task::shell("a", "a", "false")).unwrap();
        graph.add_task(Task::shell("b", "b", "echo ok").with_dependencies(vec!["a".to_string()])).unwrap();

        let sched = scheduler();
        let summary = sched.execute(graph, SchedulerContext::default()).await.unwrap();

        assert!(!summary.success);
        assert_eq!(summary.dag.task("a").unwrap().status, TaskStatus::Failed);
        assert_eq!(summary.dag.task("b").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].task_id, "a");
    }

    #[tokio::test]
    async fn allow_failure_continues_to_completion() {
        let mut graph = Graph::new("g4", "allow-failure", DagOptions::default());
        graph.add_task(Task::shell("opt", "opt", "false").with_allow_failure(true)).unwrap();
        graph
            .add_task(Task::shell("main", "main", "echo done").with_dependencies(vec!["opt".to_string()]))
            .unwrap();

        let sched = scheduler();
        let summary = sched.execute(graph, SchedulerContext::default()).await.unwrap();

        assert!(summary.success);
        assert!(summary.errors.is_empty());
        assert_eq!(summary.dag.task("main").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("flag");
        let mut graph = Graph::new("g6", "retry", DagOptions::default());
        graph
            .add_task(
                Task::shell(
                    "flaky",
                    "flaky",
                    format!("test -f {} || (touch {} && exit 1)", flag.display(), flag.display()),
                )
                .with_max_retries(2),
            )
            .unwrap();

        let sched = scheduler();
        let summary = sched.execute(graph, SchedulerContext::default()).await.unwrap();

        assert!(summary.success);
        let task = summary.dag.task("flaky").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.metadata.retry_count, 1);
    }

    #[tokio::test]
    async fn pause_blocks_new_work_until_resumed() {
        let mut graph = Graph::new("g7", "pause", DagOptions::default());
        graph.add_task(Task::shell("a", "a", "sleep 0.3 && echo done")).unwrap();

        let sched = scheduler();
        let sched_for_control = sched.clone();
        let handle = tokio::spawn(async move { sched.execute(graph, SchedulerContext::default()).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        sched_for_control.pause();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());

        sched_for_control.resume();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.success);
        assert_eq!(summary.dag.task("a").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_mid_flight_stops_running_and_pending_tasks() {
        let mut graph = Graph::new("g5", "cancel", DagOptions::default());
        graph.add_task(Task::shell("long", "long", "sleep 5")).unwrap();
        graph
            .add_task(Task::shell("after", "after", "echo never").with_dependencies(vec!["long".to_string()]))
            .unwrap();

        let sched = scheduler();
        let sched_for_cancel = sched.clone();
        let handle = tokio::spawn(async move { sched.execute(graph, SchedulerContext::default()).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        sched_for_cancel.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.dag.status, DagStatus::Cancelled);
        assert_eq!(summary.dag.task("long").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(summary.dag.task("after").unwrap().status, TaskStatus::Cancelled);
    }
}
