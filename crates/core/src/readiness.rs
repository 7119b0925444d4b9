//! Readiness and failure propagation (C4).

use std::collections::HashSet;

use taskdag_common::FailureStrategy;

use crate::dag::Graph;
use crate::types::{Task, TaskId, TaskStatus};

/// Outcome of a single `get_ready_tasks` call: the full ready set (sorted
/// by descending priority) plus the subset newly promoted this call, which
/// the caller uses to emit `task:ready` events only once per promotion.
#[derive(Debug, Default)]
pub struct ReadyResult {
    pub ready: Vec<TaskId>,
    pub newly_ready: Vec<TaskId>,
}

fn dependency_conditions_met(graph: &Graph, task_id: &str) -> bool {
    let task = graph.task(task_id).expect("task exists");
    task.dependencies.iter().all(|dep_id| {
        let dep = graph.task(dep_id).expect("dependency exists");
        Task::dependency_satisfied(dep.status, dep.allow_failure)
    })
}

/// Promotes every `pending` task whose dependencies are all satisfied to
/// `ready`. This is the only legal path from `pending` to `ready` (§4.4).
pub fn promote_ready_tasks(graph: &mut Graph) -> Vec<TaskId> {
    let candidates: Vec<TaskId> = graph
        .tasks()
        .filter(|t| t.status == TaskStatus::Pending)
        .map(|t| t.id.clone())
        .collect();

    let mut promoted = Vec::new();
    for id in candidates {
        if dependency_conditions_met(graph, &id) {
            graph.update_status(&id, TaskStatus::Ready).expect("task present");
            promoted.push(id);
        }
    }
    promoted
}

/// Re-checks readiness for a specific set of candidate ids (the direct
/// dependents of a task that just completed), narrower than a full scan.
pub fn promote_dependents(graph: &mut Graph, of_task: &str) -> Vec<TaskId> {
    let candidates: Vec<TaskId> = graph
        .task(of_task)
        .map(|t| t.dependents.clone())
        .unwrap_or_default();

    let mut promoted = Vec::new();
    for id in candidates {
        let is_pending = graph.task(&id).map(|t| t.status == TaskStatus::Pending).unwrap_or(false);
        if is_pending && dependency_conditions_met(graph, &id) {
            graph.update_status(&id, TaskStatus::Ready).expect("task present");
            promoted.push(id);
        }
    }
    promoted
}

/// `getReadyTasks()`: promotes eligible `pending` tasks, then returns every
/// `ready` task sorted by descending priority.
pub fn get_ready_tasks(graph: &mut Graph) -> ReadyResult {
    let newly_ready = promote_ready_tasks(graph);

    let mut ready: Vec<&Task> = graph.tasks().filter(|t| t.status == TaskStatus::Ready).collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority));
    let ready = ready.into_iter().map(|t| t.id.clone()).collect();

    ReadyResult { ready, newly_ready }
}

/// Effect of propagating a task's terminal failure through its dependents.
#[derive(Debug, Default)]
pub enum FailureEffect {
    /// `fail-fast` on a non-`allowFailure` task: every non-terminal task in
    /// the DAG was cancelled.
    CancelAll { cancelled: Vec<TaskId> },
    /// `continue` strategy, or the failed task was `allowFailure`: a
    /// cascade of skips (and possibly re-promotions) through dependents.
    #[default]
    None,
    Cascade { skipped: Vec<TaskId>, promoted: Vec<TaskId> },
}

/// Propagates the terminal failure of `failed_id` per §4.4. Must be called
/// only on the non-retry path (a retryable failure under budget re-arms
/// via `Graph::fail_task` and never reaches here).
pub fn propagate_failure(graph: &mut Graph, failed_id: &str) -> FailureEffect {
    let (strategy, allow_failure) = {
        let task = graph.task(failed_id).expect("failed task exists");
        (graph.options.failure_strategy, task.allow_failure)
    };

    if strategy == FailureStrategy::FailFast && !allow_failure {
        let ids: Vec<TaskId> = graph
            .tasks()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        let mut cancelled = Vec::new();
        for id in ids {
            graph.cancel_task(&id).expect("task present");
            cancelled.push(id);
        }
        return FailureEffect::CancelAll { cancelled };
    }

    let mut skipped = Vec::new();
    let mut promoted = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<TaskId> = graph
        .task(failed_id)
        .map(|t| t.dependents.clone())
        .unwrap_or_default();

    while let Some(dep_id) = stack.pop() {
        if !visited.insert(dep_id.clone()) {
            continue;
        }
        let dep_terminal = graph.task(&dep_id).map(|t| t.status.is_terminal()).unwrap_or(true);
        if dep_terminal {
            continue;
        }

        if allow_failure {
            if dependency_conditions_met(graph, &dep_id) {
                graph.update_status(&dep_id, TaskStatus::Ready).expect("task present");
                promoted.push(dep_id);
            }
            continue;
        }

        let has_valid_dependency = graph
            .task(&dep_id)
            .expect("dependent exists")
            .dependencies
            .iter()
            .any(|d| {
                let dt = graph.task(d).expect("dependency exists");
                Task::is_valid_predecessor_status(dt.status, dt.allow_failure)
            });

        if !has_valid_dependency {
            graph.skip_task(&dep_id).expect("task present");
            let next = graph.task(&dep_id).expect("task present").dependents.clone();
            skipped.push(dep_id);
            stack.extend(next);
        }
    }

    FailureEffect::Cascade { skipped, promoted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskdag_common::{DagOptions, FailureStrategy as FS};

    fn chain() -> Graph {
        let mut g = Graph::new("g", "chain", DagOptions::default());
        g.add_task(Task::shell("a", "a", "false")).unwrap();
        g.add_task(Task::shell("b", "b", "echo ok").with_dependencies(vec!["a".to_string()])).unwrap();
        g
    }

    #[test]
    fn fail_fast_cancels_everything_non_terminal() {
        let mut g = chain();
        g.update_status("a", TaskStatus::Running).unwrap();
        g.fail_task("a", crate::types::TaskFailure::non_retryable("boom")).unwrap();
        let effect = propagate_failure(&mut g, "a");
        match effect {
            FailureEffect::CancelAll { cancelled } => {
                assert!(cancelled.contains(&"b".to_string()));
            }
            _ => panic!("expected CancelAll"),
        }
        assert_eq!(g.task("b").unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn continue_strategy_skips_strict_descendants() {
        let mut opts = DagOptions::default();
        opts.failure_strategy = FS::Continue;
        let mut g = Graph::new("g", "chain", opts);
        g.add_task(Task::shell("a", "a", "false")).unwrap();
        g.add_task(Task::shell("b", "b", "echo ok").with_dependencies(vec!["a".to_string()])).unwrap();
        g.update_status("a", TaskStatus::Running).unwrap();
        g.fail_task("a", crate::types::TaskFailure::non_retryable("boom")).unwrap();
        let effect = propagate_failure(&mut g, "a");
        match effect {
            FailureEffect::Cascade { skipped, .. } => assert!(skipped.contains(&"b".to_string())),
            _ => panic!("expected Cascade"),
        }
        assert_eq!(g.task("b").unwrap().status, TaskStatus::Skipped);
    }

    #[test]
    fn allow_failure_promotes_dependent_to_ready() {
        let mut g = Graph::new("g", "chain", DagOptions::default());
        g.add_task(Task::shell("opt", "opt", "false").with_allow_failure(true)).unwrap();
        g.add_task(Task::shell("main", "main", "echo done").with_dependencies(vec!["opt".to_string()])).unwrap();
        g.update_status("opt", TaskStatus::Running).unwrap();
        g.fail_task("opt", crate::types::TaskFailure::non_retryable("boom")).unwrap();
        let effect = propagate_failure(&mut g, "opt");
        match effect {
            FailureEffect::Cascade { promoted, .. } => assert!(promoted.contains(&"main".to_string())),
            _ => panic!("expected Cascade"),
        }
        assert_eq!(g.task("main").unwrap().status, TaskStatus::Ready);
    }
}
