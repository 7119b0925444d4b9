#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! The DAG data model (C1, C2), topology analysis (C3), readiness and
//! failure propagation (C4), and event bus (C7) for the task DAG scheduler.
//!
//! Execution itself (C5, C6) lives in `taskdag-scheduler`, which depends on
//! this crate for the graph it drives.

pub mod dag;
pub mod events;
pub mod readiness;
pub mod topology;
pub mod types;

pub use dag::{DagSnapshot, Graph};
pub use events::{Event, EventBus, EventKind};
pub use readiness::{FailureEffect, ReadyResult};
pub use topology::{CriticalPath, ValidationResult};
pub use types::{
    DagStatistics, DagStatus, Priority, SharedContext, Task, TaskConfig, TaskFailure, TaskId,
    TaskMetadata, TaskOutput, TaskStatus, TaskType,
};
