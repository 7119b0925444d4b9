//! The graph store (C2): task insertion/removal, dependency symmetry,
//! status transitions (C1), and snapshot serialization.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taskdag_common::{DagOptions, Error, Result};
use tracing::instrument;

use crate::topology::CriticalPath;
use crate::types::{DagStatistics, DagStatus, SharedContext, Task, TaskFailure, TaskId, TaskOutput, TaskStatus};

/// A directed acyclic graph of tasks.
///
/// The graph owns all tasks; every other component refers to them by id.
/// Structural mutation (`add_task`, `add_dependency`, `remove_task`) marks
/// the cached topological order and critical path dirty (§4.3); status
/// transitions do not.
#[derive(Debug, Clone)]
pub struct Graph {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub options: DagOptions,
    tasks: HashMap<TaskId, Task>,
    pub shared_context: SharedContext,
    pub status: DagStatus,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub(crate) topo_cache: Option<Vec<TaskId>>,
    pub(crate) critical_path_cache: Option<CriticalPath>,
}

/// The wire format produced by `Graph::to_snapshot` / consumed by
/// `Graph::from_snapshot`. Preserves graph shape; does not preserve event
/// listeners or in-flight handles (§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DagSnapshot {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    pub options: DagOptions,
}

impl Graph {
    #[instrument(skip(options))]
    pub fn new(id: impl Into<String>, name: impl Into<String>, options: DagOptions) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            options,
            tasks: HashMap::new(),
            shared_context: HashMap::new(),
            status: DagStatus::Idle,
            started_at: None,
            completed_at: None,
            topo_cache: None,
            critical_path_cache: None,
        }
    }

    fn mark_dirty(&mut self) {
        self.topo_cache = None;
        self.critical_path_cache = None;
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Insert a task, rejecting it if any declared dependency is missing
    /// (§4.2 "reject adding a task whose dependencies are not already
    /// present"), then wire up reverse `dependents` links (invariant 1).
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::Graph(format!("duplicate task id {:?}", task.id)));
        }
        for dep in &task.dependencies {
            if !self.tasks.contains_key(dep) {
                return Err(Error::Graph(format!(
                    "task {:?} depends on missing task {:?}",
                    task.id, dep
                )));
            }
        }
        let id = task.id.clone();
        let deps = task.dependencies.clone();
        self.tasks.insert(id.clone(), task);
        for dep in deps {
            if let Some(dep_task) = self.tasks.get_mut(&dep) {
                if !dep_task.dependents.contains(&id) {
                    dep_task.dependents.push(id.clone());
                }
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// Idempotent: adding an already-present dependency edge is a no-op.
    #[instrument(skip(self))]
    pub fn add_dependency(&mut self, task_id: &str, depends_on: &str) -> Result<()> {
        if !self.tasks.contains_key(depends_on) {
            return Err(Error::Graph(format!("missing dependency task {:?}", depends_on)));
        }
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::Graph(format!("missing task {:?}", task_id)))?;
        if !task.dependencies.iter().any(|d| d == depends_on) {
            task.dependencies.push(depends_on.to_string());
        }
        let dep = self.tasks.get_mut(depends_on).expect("checked above");
        if !dep.dependents.iter().any(|d| d == task_id) {
            dep.dependents.push(task_id.to_string());
        }
        self.mark_dirty();
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_task(&mut self, task_id: &str) -> Result<Task> {
        let removed = self
            .tasks
            .remove(task_id)
            .ok_or_else(|| Error::Graph(format!("no such task {:?}", task_id)))?;
        for dep in &removed.dependencies {
            if let Some(dep_task) = self.tasks.get_mut(dep) {
                dep_task.dependents.retain(|d| d != task_id);
            }
        }
        for dependent in &removed.dependents {
            if let Some(dependent_task) = self.tasks.get_mut(dependent) {
                dependent_task.dependencies.retain(|d| d != task_id);
            }
        }
        self.mark_dirty();
        Ok(removed)
    }

    // --- Status machine (C1) -------------------------------------------

    #[instrument(skip(self))]
    pub fn update_status(&mut self, id: &str, status: TaskStatus) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::Graph(format!("no such task {:?}", id)))?;
        task.status = status;
        Ok(())
    }

    /// Requires the task is currently `ready`.
    #[instrument(skip(self))]
    pub fn start_task(&mut self, id: &str) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::Graph(format!("no such task {:?}", id)))?;
        if task.status != TaskStatus::Ready {
            return Err(Error::Internal(format!(
                "task {:?} started from non-ready status {:?}",
                id, task.status
            )));
        }
        task.status = TaskStatus::Running;
        task.metadata.started_at = Some(Utc::now());
        Ok(())
    }

    #[instrument(skip(self, output))]
    pub fn complete_task(&mut self, id: &str, output: TaskOutput) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::Graph(format!("no such task {:?}", id)))?;
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        finalize_timestamps(task);
        Ok(())
    }

    /// Implements the retry-vs-terminal branch from §4.1: retryable
    /// failures under the retry budget re-arm to `ready` and never reach
    /// this function's terminal branch.
    #[instrument(skip(self, failure))]
    pub fn fail_task(&mut self, id: &str, failure: TaskFailure) -> Result<bool> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::Graph(format!("no such task {:?}", id)))?;
        if failure.retryable && task.metadata.retry_count < task.metadata.max_retries {
            task.metadata.retry_count += 1;
            task.status = TaskStatus::Ready;
            return Ok(true);
        }
        task.status = TaskStatus::Failed;
        task.failure = Some(failure);
        finalize_timestamps(task);
        Ok(false)
    }

    /// No-op if the task is already terminal.
    #[instrument(skip(self))]
    pub fn cancel_task(&mut self, id: &str) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::Graph(format!("no such task {:?}", id)))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus::Cancelled;
        finalize_timestamps(task);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn skip_task(&mut self, id: &str) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::Graph(format!("no such task {:?}", id)))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus::Skipped;
        finalize_timestamps(task);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn statistics(&self, max_parallelism: usize) -> DagStatistics {
        let mut stats = DagStatistics {
            max_parallelism,
            ..DagStatistics::default()
        };
        stats.total_tasks = self.tasks.len();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                TaskStatus::Skipped => stats.skipped_tasks += 1,
                TaskStatus::Running => stats.running_tasks += 1,
                TaskStatus::Pending => stats.pending_tasks += 1,
                TaskStatus::Ready => stats.ready_tasks += 1,
                TaskStatus::Cancelled => {}
            }
            if let Some(duration) = task.metadata.duration_ms {
                stats.total_duration_ms += duration;
            }
            stats.total_cost += task.metadata.cost;
        }
        stats.critical_path_duration_ms = self.critical_path_cache.as_ref().map(|cp| cp.total_duration_ms);
        stats
    }

    /// Restores every task to `pending`, clears retry/output/failure state
    /// and the shared context, and sets DAG status back to `idle`. Graph
    /// shape (tasks, dependencies) is preserved.
    #[instrument(skip(self))]
    pub fn reset(&mut self) {
        for task in self.tasks.values_mut() {
            task.status = TaskStatus::Pending;
            task.metadata.retry_count = 0;
            task.metadata.started_at = None;
            task.metadata.completed_at = None;
            task.metadata.duration_ms = None;
            task.output = None;
            task.failure = None;
        }
        self.shared_context.clear();
        self.status = DagStatus::Idle;
        self.started_at = None;
        self.completed_at = None;
        self.mark_dirty();
    }

    pub fn to_snapshot(&self) -> DagSnapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        DagSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            tasks,
            options: self.options.clone(),
        }
    }

    /// Restores a graph from a snapshot. Tasks are added in dependency
    /// order; if a cycle is present, the remaining tasks are appended
    /// without resolving their dependencies. The intent is a lossless
    /// round-trip of shape, not correctness enforcement at parse time —
    /// `validate()` will later surface the cycle.
    pub fn from_snapshot(snapshot: DagSnapshot) -> Self {
        let mut graph = Graph::new(snapshot.id, snapshot.name, snapshot.options);
        graph.description = snapshot.description;

        let mut remaining: HashMap<TaskId, Task> =
            snapshot.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

        loop {
            let ready_ids: Vec<TaskId> = remaining
                .iter()
                .filter(|(_, t)| t.dependencies.iter().all(|d| graph.tasks.contains_key(d)))
                .map(|(id, _)| id.clone())
                .collect();
            if ready_ids.is_empty() {
                break;
            }
            for id in ready_ids {
                if let Some(task) = remaining.remove(&id) {
                    let _ = graph.add_task(task);
                }
            }
        }

        // Cycle (or dangling dependency): append what's left as-is so the
        // snapshot round-trips losslessly; validate() will reject it.
        for (id, mut task) in remaining {
            task.dependents.clear();
            graph.tasks.insert(id, task);
        }
        graph.mark_dirty();
        graph
    }
}

fn finalize_timestamps(task: &mut Task) {
    let now = Utc::now();
    task.metadata.completed_at = Some(now);
    if let Some(started) = task.metadata.started_at {
        task.metadata.duration_ms = Some((now - started).num_milliseconds());
    }
}
