//! stagegate - a CI/CD workflow engine
//!
//! Workflows are DAGs of jobs gated by `needs` and `if` conditions, with
//! matrix expansion, named concurrency groups, artifacts handed between
//! jobs, and guarded deploy and publish steps.

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod runner;

// Re-export commonly used types
pub use core::config::WorkflowConfig;
pub use core::{EventKind, Job, JobResult, JobState, RunStatus, TriggerEvent, Workflow};
pub use execution::{
    dispatch, EngineError, EngineOptions, ExecutionEngine, ExecutionEvent, SchedulingStrategy,
};
pub use runner::{LocalRunner, RunnerConfig, RunnerError, StepRunner};
