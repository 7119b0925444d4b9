//! Opaque, snapshot-only context passed from the scheduler into executors.

use std::collections::HashMap;
use std::sync::Arc;

use taskdag_core::{SharedContext, TaskId, TaskOutput, TaskStatus};

/// Carries a working directory and an optional parent-tool-call
/// correlation id for subagent message tracking (§6).
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub working_directory: Option<String>,
    pub parent_tool_call_id: Option<String>,
}

/// Caller-supplied, scheduler-opaque configuration forwarded to agent
/// executors unmodified. The scheduler never reads `model_config` or
/// `tool_registry`; it only threads them through.
#[derive(Clone)]
pub struct SchedulerContext {
    pub model_config: Arc<serde_json::Value>,
    pub tool_registry: Arc<HashMap<String, serde_json::Value>>,
    pub tool_context: ToolContext,
    pub working_directory: Option<String>,
    pub remaining_budget: Option<u64>,
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self {
            model_config: Arc::new(serde_json::Value::Null),
            tool_registry: Arc::new(HashMap::new()),
            tool_context: ToolContext::default(),
            working_directory: None,
            remaining_budget: None,
        }
    }
}

/// Per-task context built by the scheduler before invoking an executor
/// (§4.5 step 2). Executors receive a snapshot, never a live reference to
/// the graph's shared context, to avoid cross-task races (§5, §9).
#[derive(Debug, Clone, Default)]
pub struct TaskExecutionContext {
    pub dependency_outputs: HashMap<TaskId, TaskOutput>,
    /// Terminal status of every dependency, used by the checkpoint
    /// executor's `requireAllSuccess` check.
    pub dependency_statuses: HashMap<TaskId, TaskStatus>,
    pub shared_context: SharedContext,
    pub working_directory: Option<String>,
    pub remaining_budget: Option<u64>,
    pub tool_context: ToolContext,
}
