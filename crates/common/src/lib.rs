#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared error taxonomy, configuration, and tracing setup for the task DAG
//! scheduler workspace.

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{Config, DagOptions, FailureStrategy, SchedulerConfig};
pub use error::{Error, Result};

/// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};