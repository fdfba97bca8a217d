//! Workflow execution: scheduling, job execution and concurrency groups

pub mod concurrency;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod scheduler;

pub use concurrency::{CancelSignal, ConcurrencyLease, ConcurrencyRegistry};
pub use dispatcher::{dispatch, DispatchOutcome};
pub use engine::{EngineError, EngineOptions, EventSink, ExecutionEngine, ExecutionEvent};
pub use executor::{JobExecutor, JobOutcome, JobPlan, JobReport};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
