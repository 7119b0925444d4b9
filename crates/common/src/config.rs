//! Configuration loading for the scheduler and its DAG defaults

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Failure propagation strategy for a DAG (spec.md §3 "Options")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStrategy {
    FailFast,
    Continue,
    RetryThenContinue,
}

impl Default for FailureStrategy {
    fn default() -> Self {
        FailureStrategy::FailFast
    }
}

/// Default options applied to a DAG at construction time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DagOptions {
    pub max_parallelism: usize,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
    pub global_budget: Option<u64>,
    pub failure_strategy: FailureStrategy,
    pub enable_output_passing: bool,
    pub enable_shared_context: bool,
}

impl Default for DagOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            default_timeout_ms: 120_000,
            default_max_retries: 0,
            global_budget: None,
            failure_strategy: FailureStrategy::FailFast,
            enable_output_passing: true,
            enable_shared_context: true,
        }
    }
}

/// Scheduler-wide knobs, independent of any single DAG's options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub max_parallelism: usize,
    pub schedule_interval_ms: u64,
    pub enable_output_passing: bool,
    pub default_timeout_ms: u64,
    pub max_output_size: usize,
    pub strict_dependency_check: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            schedule_interval_ms: 50,
            enable_output_passing: true,
            default_timeout_ms: 120_000,
            max_output_size: 100 * 1024,
            strict_dependency_check: true,
        }
    }
}

/// Log output shape, mirrored from the teacher's observability config.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Logging configuration, read by the CLI binary before calling
/// [`crate::telemetry::init_telemetry`]. The scheduler library itself never
/// reads this.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

/// Top-level configuration for the scheduler binary/CLI.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub dag: DagOptions,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration, layering defaults, an optional `config.toml`, and
    /// `TASKDAG__`-prefixed environment variables (in that order).
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("scheduler.max_parallelism", 4)?
            .set_default("scheduler.schedule_interval_ms", 50)?
            .set_default("scheduler.enable_output_passing", true)?
            .set_default("scheduler.default_timeout_ms", 120_000)?
            .set_default("scheduler.max_output_size", 100 * 1024)?
            .set_default("scheduler.strict_dependency_check", true)?
            .set_default("dag.max_parallelism", 4)?
            .set_default("dag.default_timeout_ms", 120_000)?
            .set_default("dag.default_max_retries", 0)?
            .set_default("dag.failure_strategy", "fail-fast")?
            .set_default("dag.enable_output_passing", true)?
            .set_default("dag.enable_shared_context", true)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "compact")?;

        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKDAG")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate cross-field constraints not expressible via `set_default`.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scheduler.max_parallelism == 0 {
            errors.push("scheduler.max_parallelism must be greater than 0".to_string());
        }
        if self.dag.max_parallelism == 0 {
            errors.push("dag.max_parallelism must be greater than 0".to_string());
        }
        if self.scheduler.max_output_size == 0 {
            errors.push("scheduler.max_output_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    proptest::proptest! {
        /// Whatever `max_parallelism`/`max_output_size` a caller sets, `validate`
        /// flags exactly the zero values and nothing else.
        #[test]
        fn validate_rejects_only_zero_bounds(
            scheduler_parallelism in 0usize..8,
            dag_parallelism in 0usize..8,
            max_output_size in 0usize..4096,
        ) {
            let mut config = Config::default();
            config.scheduler.max_parallelism = scheduler_parallelism;
            config.dag.max_parallelism = dag_parallelism;
            config.scheduler.max_output_size = max_output_size;

            let expected_errors = [scheduler_parallelism == 0, dag_parallelism == 0, max_output_size == 0]
                .into_iter()
                .filter(|bad| *bad)
                .count();

            match config.validate() {
                Ok(()) => proptest::prop_assert_eq!(expected_errors, 0),
                Err(errors) => proptest::prop_assert_eq!(errors.len(), expected_errors),
            }
        }
    }
}
