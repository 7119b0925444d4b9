//! Executor dispatch (C6): per-task-type execution behind a common trait.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskdag_common::{Error, Result};
use taskdag_core::{Task, TaskConfig, TaskOutput, TaskStatus};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::context::TaskExecutionContext;

const SHELL_KILL_GRACE: Duration = Duration::from_secs(1);

/// Runs a single task to completion. Implementors must honor
/// `cancel` cooperatively: once it's triggered, return promptly (after any
/// required child-process cleanup) rather than keep working.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskExecutionContext,
        cancel: CancellationToken,
    ) -> Result<TaskOutput>;
}

/// Result of a single agent runtime invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentRuntimeOutput {
    pub text: String,
    pub tools_used: Option<Vec<String>>,
    pub iterations: Option<u32>,
}

/// A single agent invocation request, fully resolved (role defaults merged
/// with task-level overrides).
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub role: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub tool_allowlist: Vec<String>,
    pub max_iterations: Option<u32>,
    pub parent_tool_call_id: Option<String>,
}

/// The external agent runtime. This specification only requires it to
/// respect cancellation and return a text result; how it invokes an LLM is
/// out of scope (§1).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(
        &self,
        request: AgentInvocation,
        cancel: CancellationToken,
    ) -> Result<AgentRuntimeOutput>;
}

/// Defaults for a role, merged under task-level config (task-level values
/// win when present).
#[derive(Debug, Clone, Default)]
pub struct RoleDefaults {
    pub system_prompt: Option<String>,
    pub tool_allowlist: Vec<String>,
    pub max_iterations: Option<u32>,
}

/// Built-in executor for `agent` tasks.
pub struct AgentExecutor {
    runtime: Arc<dyn AgentRuntime>,
    role_defaults: Arc<HashMap<String, RoleDefaults>>,
}

impl AgentExecutor {
    pub fn new(runtime: Arc<dyn AgentRuntime>, role_defaults: Arc<HashMap<String, RoleDefaults>>) -> Self {
        Self { runtime, role_defaults }
    }
}

#[async_trait]
impl Executor for AgentExecutor {
    #[instrument(skip(self, task, ctx, cancel), fields(task_id = %task.id))]
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskExecutionContext,
        cancel: CancellationToken,
    ) -> Result<TaskOutput> {
        let TaskConfig::Agent { role, prompt, system_prompt, tool_allowlist, max_iterations } = &task.config
        else {
            return Err(Error::Internal(format!("task {:?} is not an agent task", task.id)));
        };

        let defaults = self.role_defaults.get(role).cloned().unwrap_or_default();

        let mut prompt = prompt.clone();
        if !ctx.dependency_outputs.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&render_dependency_outputs(ctx));
        }

        let invocation = AgentInvocation {
            role: role.clone(),
            prompt,
            system_prompt: system_prompt.clone().or(defaults.system_prompt),
            tool_allowlist: if tool_allowlist.is_empty() { defaults.tool_allowlist } else { tool_allowlist.clone() },
            max_iterations: (*max_iterations).or(defaults.max_iterations),
            parent_tool_call_id: ctx.tool_context.parent_tool_call_id.clone(),
        };

        let result = self.runtime.invoke(invocation, cancel).await?;
        let data = extract_structured_data(&result.text);

        Ok(TaskOutput { text: result.text, data, tools_used: result.tools_used, iterations: result.iterations })
    }
}

/// Deterministic textual rendering of dependency outputs for prompt
/// injection (§4.5 "Output passing"): each entry is the id, its text, and a
/// fenced JSON block if structured data exists.
fn render_dependency_outputs(ctx: &TaskExecutionContext) -> String {
    let mut ids: Vec<&String> = ctx.dependency_outputs.keys().collect();
    ids.sort();

    let mut rendered = String::new();
    for id in ids {
        let output = &ctx.dependency_outputs[id];
        rendered.push_str(&format!("### Output from `{id}`\n{}\n", output.text));
        if let Some(data) = &output.data {
            rendered.push_str(&format!("```json\n{}\n```\n", data));
        }
    }
    rendered
}

/// Extracts a JSON object/array from agent text output: a fenced
/// ` ```json ` block takes priority; otherwise the whole trimmed text is
/// tried if it looks like JSON. Absent on parse failure.
fn extract_structured_data(text: &str) -> Option<serde_json::Value> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + "```json".len()..];
        if let Some(end) = after.find("```") {
            let block = after[..end].trim();
            if let Ok(value) = serde_json::from_str(block) {
                return Some(value);
            }
        }
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).ok();
    }
    None
}

/// Built-in executor for `shell` tasks.
pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    #[instrument(skip(self, task, ctx, cancel), fields(task_id = %task.id))]
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskExecutionContext,
        cancel: CancellationToken,
    ) -> Result<TaskOutput> {
        let TaskConfig::Shell { command, cwd, env } = &task.config else {
            return Err(Error::Internal(format!("task {:?} is not a shell task", task.id)));
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(false);

        let working_directory = cwd.clone().or_else(|| ctx.working_directory.clone());
        if let Some(dir) = working_directory {
            cmd.current_dir(dir);
        }
        cmd.envs(env);

        let mut child = cmd.spawn().map_err(|e| Error::Io(e))?;
        let mut stdout_pipe = child.stdout.take().expect("piped stdout");
        let mut stderr_pipe = child.stderr.take().expect("piped stderr");

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(Error::Io)?;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                build_shell_output(&task.id, status.success(), stdout, stderr)
            }
            _ = cancel.cancelled() => {
                terminate_child(&mut child, task.id.as_str()).await;
                Err(Error::Cancelled(format!("shell task {:?} cancelled", task.id)))
            }
        }
    }
}

fn build_shell_output(task_id: &str, success: bool, stdout: String, stderr: String) -> Result<TaskOutput> {
    let mut text = stdout;
    if !stderr.is_empty() {
        text.push_str("\n[stderr]: ");
        text.push_str(&stderr);
    }
    if !success {
        return Err(Error::TaskFailure(format!("shell task {task_id:?} exited with a non-zero status")));
    }
    Ok(TaskOutput::text_only(text))
}

/// `SIGTERM`, wait up to one second, then `SIGKILL` if still alive.
/// Grounded on the same shutdown sequence used for spawned agent
/// subprocesses elsewhere in the corpus.
#[allow(unsafe_code)]
async fn terminate_child(child: &mut tokio::process::Child, task_id: &str) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            // SAFETY: pid is a valid u32 from a child we spawned and are still holding.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(task_id, pid, "SIGTERM failed, proceeding straight to SIGKILL");
            }
        }
    }

    match tokio::time::timeout(SHELL_KILL_GRACE, child.wait()).await {
        Ok(Ok(_)) => debug!(task_id, "child exited after SIGTERM"),
        _ => {
            debug!(task_id, "child still alive after grace period, sending SIGKILL");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// Built-in executor for `checkpoint` tasks.
pub struct CheckpointExecutor;

#[async_trait]
impl Executor for CheckpointExecutor {
    #[instrument(skip(self, task, ctx, _cancel), fields(task_id = %task.id))]
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<TaskOutput> {
        let TaskConfig::Checkpoint { name, require_all_success, collect_outputs } = &task.config else {
            return Err(Error::Internal(format!("task {:?} is not a checkpoint task", task.id)));
        };

        if *require_all_success {
            let all_completed = task
                .dependencies
                .iter()
                .all(|dep| matches!(ctx.dependency_statuses.get(dep), Some(TaskStatus::Completed)));
            if !all_completed {
                return Err(Error::TaskFailure(format!(
                    "Checkpoint {name} failed: not all dependencies completed successfully"
                )));
            }
        }

        let mut summary = format!("Checkpoint {name}: ");
        let statuses: Vec<String> = task
            .dependencies
            .iter()
            .map(|dep| format!("{dep}={:?}", ctx.dependency_statuses.get(dep).unwrap_or(&TaskStatus::Pending)))
            .collect();
        summary.push_str(&statuses.join(", "));

        let data = if *collect_outputs {
            let mut map = serde_json::Map::new();
            for dep in &task.dependencies {
                if let Some(output) = ctx.dependency_outputs.get(dep) {
                    let text: String = output.text.chars().take(500).collect();
                    let mut entry = serde_json::Map::new();
                    entry.insert("text".to_string(), serde_json::Value::String(text));
                    entry.insert("data".to_string(), output.data.clone().unwrap_or(serde_json::Value::Null));
                    map.insert(dep.clone(), serde_json::Value::Object(entry));
                }
            }
            Some(serde_json::Value::Object(map))
        } else {
            None
        };

        Ok(TaskOutput { text: summary, data, tools_used: None, iterations: None })
    }
}

/// Maps task-type strings to their executor, used for both the three
/// built-ins and any custom executor a caller registers (§4.6, §9).
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(type_name.into(), executor);
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(type_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json_block() {
        let text = "here you go:\n```json\n{\"a\": 1}\n```\ndone";
        let data = extract_structured_data(text).unwrap();
        assert_eq!(data["a"], 1);
    }

    #[test]
    fn extracts_whole_text_json() {
        let text = "  {\"ok\": true}  ";
        let data = extract_structured_data(text).unwrap();
        assert_eq!(data["ok"], true);
    }

    #[test]
    fn non_json_text_has_no_data() {
        assert!(extract_structured_data("just plain text").is_none());
    }

    #[tokio::test]
    async fn shell_executor_captures_stdout() {
        let task = Task::shell("a", "a", "echo hello");
        let ctx = TaskExecutionContext::default();
        let output = ShellExecutor.execute(&task, &ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(output.text.trim(), "hello");
    }

    #[tokio::test]
    async fn shell_executor_fails_on_nonzero_exit() {
        let task = Task::shell("a", "a", "false");
        let ctx = TaskExecutionContext::default();
        let err = ShellExecutor.execute(&task, &ctx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailure(_)));
    }

    #[tokio::test]
    async fn checkpoint_requires_all_success() {
        let task = Task::checkpoint("cp", "cp", vec!["a".to_string()], true, false);
        let mut ctx = TaskExecutionContext::default();
        ctx.dependency_statuses.insert("a".to_string(), TaskStatus::Failed);
        let err = CheckpointExecutor.execute(&task, &ctx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailure(_)));
    }

    #[tokio::test]
    async fn shell_executor_honors_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();

        let task = Task::new(
            "a",
            "a",
            taskdag_core::TaskType::Shell,
            TaskConfig::Shell {
                command: "cat marker.txt".to_string(),
                cwd: Some(dir.path().to_string_lossy().to_string()),
                env: HashMap::new(),
            },
        );
        let ctx = TaskExecutionContext::default();
        let output = ShellExecutor.execute(&task, &ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(output.text.trim(), "present");
    }

    #[tokio::test]
    async fn agent_executor_merges_role_defaults_and_parses_output() {
        let mut runtime = MockAgentRuntime::new();
        runtime.expect_invoke().returning(|request, _cancel| {
            assert_eq!(request.system_prompt.as_deref(), Some("be terse"));
            assert_eq!(request.tool_allowlist, vec!["read_file".to_string()]);
            Ok(AgentRuntimeOutput {
                text: "```json\n{\"status\": \"ok\"}\n```".to_string(),
                tools_used: Some(vec!["read_file".to_string()]),
                iterations: Some(1),
            })
        });

        let mut role_defaults = HashMap::new();
        role_defaults.insert(
            "reviewer".to_string(),
            RoleDefaults {
                system_prompt: Some("be terse".to_string()),
                tool_allowlist: vec!["read_file".to_string()],
                max_iterations: Some(3),
            },
        );

        let executor = AgentExecutor::new(Arc::new(runtime), Arc::new(role_defaults));
        let task = Task::agent("a", "a", "reviewer", "review this diff");
        let ctx = TaskExecutionContext::default();

        let output = executor.execute(&task, &ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(output.data.unwrap()["status"], "ok");
    }
}
