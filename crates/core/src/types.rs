//! The task data model and status machine (C1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Caller-assigned, unique-within-DAG task identifier.
pub type TaskId = String;

/// Task priority. Ordered so that `Critical > High > Normal > Low`, which is
/// exactly the tie-break order the topological sort and ready-queue use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Task type. `Agent`, `Shell`, and `Checkpoint` have built-in executors;
/// the rest are declared so callers can register custom executors for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Agent,
    Shell,
    Checkpoint,
    Workflow,
    Function,
    Parallel,
    Conditional,
    Evaluate,
}

impl TaskType {
    /// Registry key used to look up an executor for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Agent => "agent",
            TaskType::Shell => "shell",
            TaskType::Checkpoint => "checkpoint",
            TaskType::Workflow => "workflow",
            TaskType::Function => "function",
            TaskType::Parallel => "parallel",
            TaskType::Conditional => "conditional",
            TaskType::Evaluate => "evaluate",
        }
    }
}

/// Status of a task in the scheduler's state machine.
///
/// Permitted transitions: `Pending -> Ready -> Running -> {Completed, Failed,
/// Cancelled}`; `Pending -> Skipped`; `Failed -> Ready` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    /// Terminal set = `{Completed, Failed, Cancelled, Skipped}`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }
}

/// Per-type configuration payload. Tagged so that payload access is total
/// and checked rather than an "as"-cast on an opaque map.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskConfig {
    Agent {
        role: String,
        prompt: String,
        system_prompt: Option<String>,
        #[serde(default)]
        tool_allowlist: Vec<String>,
        max_iterations: Option<u32>,
    },
    Shell {
        command: String,
        cwd: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Checkpoint {
        name: String,
        require_all_success: bool,
        collect_outputs: bool,
    },
    /// Payload for a registered custom executor (`workflow`, `function`,
    /// `parallel`, `conditional`, `evaluate`, or any other type string).
    Custom(serde_json::Value),
}

impl TaskConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskConfig::Agent { .. } => "agent",
            TaskConfig::Shell { .. } => "shell",
            TaskConfig::Checkpoint { .. } => "checkpoint",
            TaskConfig::Custom(_) => "custom",
        }
    }
}

/// Timestamps and retry/cost bookkeeping for a single task.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskMetadata {
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub estimated_duration_ms: Option<u64>,
    pub cost: f64,
}

/// Successful task output.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskOutput {
    pub text: String,
    pub data: Option<serde_json::Value>,
    pub tools_used: Option<Vec<String>>,
    pub iterations: Option<u32>,
}

impl TaskOutput {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
            tools_used: None,
            iterations: None,
        }
    }
}

/// Failure record attached to a `failed` task.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskFailure {
    pub message: String,
    pub code: Option<String>,
    pub retryable: bool,
    pub stack: Option<String>,
}

impl TaskFailure {
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
            stack: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
            stack: None,
        }
    }
}

/// A node in the DAG.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
    pub config: TaskConfig,
    pub timeout_ms: Option<u64>,
    pub allow_failure: bool,
    pub metadata: TaskMetadata,
    pub output: Option<TaskOutput>,
    pub failure: Option<TaskFailure>,
}

impl Task {
    /// Build a task with caller-supplied fields and DAG-option defaults
    /// (`timeout_ms`, `max_retries`) filled in where the caller left them
    /// unset. Status always starts `pending`.
    pub fn new(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        task_type: TaskType,
        config: TaskConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            task_type,
            status: TaskStatus::Pending,
            priority: Priority::default(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            config,
            timeout_ms: None,
            allow_failure: false,
            metadata: TaskMetadata {
                created_at: Some(Utc::now()),
                ..TaskMetadata::default()
            },
            output: None,
            failure: None,
        }
    }

    pub fn agent(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        role: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            name,
            TaskType::Agent,
            TaskConfig::Agent {
                role: role.into(),
                prompt: prompt.into(),
                system_prompt: None,
                tool_allowlist: Vec::new(),
                max_iterations: None,
            },
        )
    }

    pub fn shell(id: impl Into<TaskId>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            id,
            name,
            TaskType::Shell,
            TaskConfig::Shell {
                command: command.into(),
                cwd: None,
                env: HashMap::new(),
            },
        )
    }

    pub fn checkpoint(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        dependencies: Vec<TaskId>,
        require_all_success: bool,
        collect_outputs: bool,
    ) -> Self {
        let checkpoint_name = name.into();
        let mut task = Self::new(
            id,
            checkpoint_name.clone(),
            TaskType::Checkpoint,
            TaskConfig::Checkpoint {
                name: checkpoint_name,
                require_all_success,
                collect_outputs,
            },
        );
        task.dependencies = dependencies;
        task
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_allow_failure(mut self, allow_failure: bool) -> Self {
        self.allow_failure = allow_failure;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.metadata.max_retries = max_retries;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// A dependency is "valid" (per §4.4) while it could still resolve in a
    /// way that lets this task become ready: it hasn't failed-without-allow.
    pub fn is_valid_predecessor_status(status: TaskStatus, allow_failure: bool) -> bool {
        match status {
            TaskStatus::Completed | TaskStatus::Running | TaskStatus::Ready | TaskStatus::Pending => true,
            TaskStatus::Failed => allow_failure,
            TaskStatus::Cancelled | TaskStatus::Skipped => false,
        }
    }

    /// Whether `dependency_status` satisfies readiness for this task (a
    /// dependency is satisfied when it's `completed`, or `failed` with
    /// `allowFailure=true` on the dependency itself).
    pub fn dependency_satisfied(dependency_status: TaskStatus, dependency_allow_failure: bool) -> bool {
        matches!(dependency_status, TaskStatus::Completed)
            || (matches!(dependency_status, TaskStatus::Failed) && dependency_allow_failure)
    }
}

/// DAG-wide execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DagStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Point-in-time snapshot of DAG progress, recomputed after every
/// state-mutating operation (§4.7 `progress:update`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DagStatistics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub running_tasks: usize,
    pub pending_tasks: usize,
    pub ready_tasks: usize,
    pub total_duration_ms: i64,
    pub total_cost: f64,
    pub max_parallelism: usize,
    pub critical_path_duration_ms: Option<u64>,
}

/// Shared key/value context attached to a DAG, visible to all tasks.
pub type SharedContext = HashMap<String, serde_json::Value>;
