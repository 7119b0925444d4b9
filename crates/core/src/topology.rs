//! Topology and analysis (C3): topological order, execution levels,
//! critical path, and structural validation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use taskdag_common::{Error, Result};

use crate::dag::Graph;
use crate::types::{Priority, TaskConfig, TaskId};

/// A task queued for topological emission, ordered by descending priority
/// and, among equal priorities, ascending id for determinism.
#[derive(Eq, PartialEq)]
struct ReadyEntry {
    priority: Priority,
    id: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Kahn's algorithm; at each step the zero-in-degree set is drained highest
/// priority first. Returns `Err` if the produced order is shorter than the
/// task count, i.e. a cycle exists.
pub fn topological_order(graph: &Graph) -> Result<Vec<TaskId>> {
    let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
    for task in graph.tasks() {
        in_degree.insert(task.id.clone(), task.dependencies.len());
    }

    let mut heap = BinaryHeap::new();
    for task in graph.tasks() {
        if task.dependencies.is_empty() {
            heap.push(ReadyEntry { priority: task.priority, id: task.id.clone() });
        }
    }

    let mut order = Vec::with_capacity(graph.task_count());
    while let Some(ReadyEntry { id, .. }) = heap.pop() {
        let task = graph.task(&id).expect("task present in in_degree map");
        for dependent in &task.dependents {
            let remaining = in_degree.get_mut(dependent).expect("dependent tracked");
            *remaining -= 1;
            if *remaining == 0 {
                let dep_task = graph.task(dependent).expect("dependent exists");
                heap.push(ReadyEntry { priority: dep_task.priority, id: dependent.clone() });
            }
        }
        order.push(id);
    }

    if order.len() != graph.task_count() {
        return Err(Error::Graph("cycle detected in task graph".to_string()));
    }
    Ok(order)
}

/// Partitions tasks into minimum-height levels: level 0 has no
/// dependencies; level k+1's tasks all have every dependency in levels
/// <= k. Tasks within a level are ordered by descending priority.
pub fn execution_levels(graph: &Graph) -> Result<Vec<Vec<TaskId>>> {
    let order = topological_order(graph)?;

    let mut level_of: HashMap<TaskId, usize> = HashMap::new();
    let mut max_level = 0usize;
    for id in &order {
        let task = graph.task(id).expect("topological order only contains present tasks");
        let level = task
            .dependencies
            .iter()
            .map(|d| level_of.get(d).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        max_level = max_level.max(level);
        level_of.insert(id.clone(), level);
    }

    let mut levels: Vec<Vec<TaskId>> = vec![Vec::new(); max_level + 1];
    for id in order {
        let level = level_of[&id];
        levels[level].push(id);
    }
    for level in &mut levels {
        level.sort_by(|a, b| {
            let pa = graph.task(a).expect("task exists").priority;
            let pb = graph.task(b).expect("task exists").priority;
            pb.cmp(&pa)
        });
    }
    Ok(levels)
}

/// Longest path through the DAG, weighting each task by its
/// `estimatedDuration` when present and the DAG's `defaultTimeout`
/// otherwise.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CriticalPath {
    pub task_ids: Vec<TaskId>,
    pub total_duration_ms: u64,
}

pub fn critical_path(graph: &Graph) -> Result<CriticalPath> {
    let order = topological_order(graph)?;
    if order.is_empty() {
        return Ok(CriticalPath::default());
    }

    let default_weight = graph.options.default_timeout_ms;
    let mut dist: HashMap<TaskId, u64> = HashMap::new();
    let mut prev: HashMap<TaskId, TaskId> = HashMap::new();

    for id in &order {
        let task = graph.task(id).expect("task exists");
        let weight = task.metadata.estimated_duration_ms.unwrap_or(default_weight);
        let mut best = weight;
        let mut best_prev = None;
        for dep in &task.dependencies {
            let candidate = dist.get(dep).copied().unwrap_or(0) + weight;
            if candidate > best {
                best = candidate;
                best_prev = Some(dep.clone());
            }
        }
        dist.insert(id.clone(), best);
        if let Some(p) = best_prev {
            prev.insert(id.clone(), p);
        }
    }

    let (farthest, total) = dist
        .iter()
        .max_by_key(|(_, d)| **d)
        .map(|(k, v)| (k.clone(), *v))
        .expect("order is non-empty");

    let mut path = Vec::new();
    let mut cursor = Some(farthest);
    while let Some(id) = cursor {
        cursor = prev.get(&id).cloned();
        path.push(id);
    }
    path.reverse();

    Ok(CriticalPath { task_ids: path, total_duration_ms: total })
}

/// Result of structural validation (§4.3).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn validate(graph: &Graph) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if graph.task_count() == 0 {
        errors.push("graph has no tasks".to_string());
    }

    for task in graph.tasks() {
        for dep in &task.dependencies {
            if !graph.contains(dep) {
                errors.push(format!("task {:?} depends on missing task {:?}", task.id, dep));
            }
        }
        if let TaskConfig::Agent { role, prompt, .. } = &task.config {
            if role.trim().is_empty() {
                errors.push(format!("agent task {:?} is missing a role", task.id));
            }
            if prompt.trim().is_empty() {
                errors.push(format!("agent task {:?} is missing a prompt", task.id));
            }
        }
    }

    if errors.is_empty() && topological_order(graph).is_err() {
        errors.push("graph contains a cycle".to_string());
    }

    if graph.task_count() > 0 && !graph.tasks().any(|t| t.dependencies.is_empty()) {
        errors.push("graph has no entry point".to_string());
    }

    if graph.task_count() > 1 {
        for task in graph.tasks() {
            if task.dependencies.is_empty() && task.dependents.is_empty() {
                warnings.push(format!("task {:?} is isolated", task.id));
            }
        }
    }

    ValidationResult { valid: errors.is_empty(), errors, warnings }
}

impl Graph {
    /// Lazily computed and cached; invalidated on structural mutation.
    pub fn topological_order(&mut self) -> Result<Vec<TaskId>> {
        if let Some(cached) = &self.topo_cache {
            return Ok(cached.clone());
        }
        let order = topological_order(self)?;
        self.topo_cache = Some(order.clone());
        Ok(order)
    }

    pub fn execution_levels(&self) -> Result<Vec<Vec<TaskId>>> {
        execution_levels(self)
    }

    /// Lazily computed and cached; invalidated on structural mutation.
    pub fn critical_path(&mut self) -> Result<CriticalPath> {
        if let Some(cached) = &self.critical_path_cache {
            return Ok(cached.clone());
        }
        let cp = critical_path(self)?;
        self.critical_path_cache = Some(cp.clone());
        Ok(cp)
    }

    pub fn validate(&self) -> ValidationResult {
        validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskdag_common::DagOptions;

    fn graph_with_chain() -> Graph {
        let mut g = Graph::new("g1", "chain", DagOptions::default());
        g.add_task(crate::types::Task::shell("a", "a", "echo hello")).unwrap();
        g.add_task(
            crate::types::Task::shell("b", "b", "echo world").with_dependencies(vec!["a".to_string()]),
        )
        .unwrap();
        g
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let g = graph_with_chain();
        let order = topological_order(&g).unwrap();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn detects_cycles() {
        let mut g = Graph::new("g2", "cycle", DagOptions::default());
        g.add_task(crate::types::Task::shell("a", "a", "echo a")).unwrap();
        g.add_task(
            crate::types::Task::shell("b", "b", "echo b").with_dependencies(vec!["a".to_string()]),
        )
        .unwrap();
        // Force a cycle directly on the task map bypassing add_task's check.
        g.task_mut("a").unwrap().dependencies.push("b".to_string());
        assert!(topological_order(&g).is_err());
        assert!(!g.validate().valid);
    }

    #[test]
    fn execution_levels_group_independent_tasks() {
        let mut g = Graph::new("g3", "fanout", DagOptions::default());
        g.add_task(crate::types::Task::shell("s1", "s1", "echo 1")).unwrap();
        g.add_task(crate::types::Task::shell("s2", "s2", "echo 2")).unwrap();
        g.add_task(
            crate::types::Task::checkpoint("cp", "cp", vec!["s1".to_string(), "s2".to_string()], true, true),
        )
        .unwrap();
        let levels = g.execution_levels().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 2);
        assert_eq!(levels[1], vec!["cp".to_string()]);
    }

    #[test]
    fn validate_flags_missing_agent_prompt() {
        let mut g = Graph::new("g4", "bad-agent", DagOptions::default());
        g.add_task(crate::types::Task::agent("a", "a", "coder", "")).unwrap();
        let result = g.validate();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("missing a prompt")));
    }

    proptest::proptest! {
        /// However priorities are scattered across a linear chain, the
        /// topological order must still place every task after its sole
        /// dependency (§4.3 invariant: order respects edges regardless of
        /// the priority tie-break).
        #[test]
        fn topo_order_respects_dependencies_for_random_priorities(
            priorities in proptest::collection::vec(0u8..4, 2..16)
        ) {
            use crate::types::{Priority, Task};

            let mut g = Graph::new("prop", "chain", DagOptions::default());
            for (i, p) in priorities.iter().enumerate() {
                let id = format!("t{i}");
                let priority = match p {
                    0 => Priority::Low,
                    1 => Priority::Normal,
                    2 => Priority::High,
                    _ => Priority::Critical,
                };
                let mut task = Task::shell(id.clone(), id.clone(), "true").with_priority(priority);
                if i > 0 {
                    task = task.with_dependencies(vec![format!("t{}", i - 1)]);
                }
                g.add_task(task).unwrap();
            }

            let order = topological_order(&g).unwrap();
            let pos: HashMap<TaskId, usize> =
                order.into_iter().enumerate().map(|(i, id)| (id, i)).collect();
            for i in 1..priorities.len() {
                proptest::prop_assert!(pos[&format!("t{}", i - 1)] < pos[&format!("t{i}")]);
            }
        }
    }
}
