#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! The scheduling engine: executor dispatch, per-task execution context, and
//! the coordinator loop that drives a [`taskdag_core::Graph`] to completion.

pub mod context;
pub mod executor;
pub mod scheduler;

pub use context::{SchedulerContext, TaskExecutionContext, ToolContext};
pub use executor::{
    AgentExecutor, AgentInvocation, AgentRuntime, AgentRuntimeOutput, CheckpointExecutor, Executor,
    ExecutorRegistry, RoleDefaults, ShellExecutor,
};
pub use scheduler::{ExecutionSummary, Scheduler, TaskError};
