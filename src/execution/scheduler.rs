//! Execution scheduler - determines which job instances to start next

use crate::core::{JobState, Workflow};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Strategy for scheduling job instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Run one instance at a time, in dependency order
    Sequential,

    /// Run every ready instance at once
    #[default]
    Parallel,

    /// Limited parallelism (max N concurrent instances)
    LimitedParallel(usize),
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingStrategy::Sequential => f.write_str("sequential"),
            SchedulingStrategy::Parallel => f.write_str("parallel"),
            SchedulingStrategy::LimitedParallel(n) => write!(f, "parallel-limited:{}", n),
        }
    }
}

impl FromStr for SchedulingStrategy {
    type Err = anyhow::Error;

    /// `sequential`, `parallel`, or `parallel-limited[:N]` (N defaults to 2)
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "sequential" => Ok(SchedulingStrategy::Sequential),
            "parallel" => Ok(SchedulingStrategy::Parallel),
            other => {
                let Some(rest) = other.strip_prefix("parallel-limited") else {
                    anyhow::bail!(
                        "Unknown strategy '{}' (expected sequential, parallel or parallel-limited:N)",
                        other
                    );
                };
                let limit = match rest.strip_prefix(':') {
                    Some(n) => n.parse::<usize>()?,
                    None if rest.is_empty() => 2,
                    None => anyhow::bail!("Unknown strategy '{}'", other),
                };
                if limit == 0 {
                    anyhow::bail!("parallel-limited needs a limit of at least 1");
                }
                Ok(SchedulingStrategy::LimitedParallel(limit))
            }
        }
    }
}

/// Picks instances to start among those whose gates already passed
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    /// Get the next batch of instances to start
    pub fn next_instances(&self, workflow: &Workflow) -> Vec<String> {
        let running = workflow.running_instances().len();
        let slots = match self.strategy {
            SchedulingStrategy::Sequential => 1usize.saturating_sub(running),
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(max) => max.saturating_sub(running),
        };
        if slots == 0 {
            return vec![];
        }

        // per-job `max_parallel` caps
        let mut active: HashMap<&str, usize> = HashMap::new();
        for instance in workflow.running_instances() {
            *active.entry(instance.job_id.as_str()).or_insert(0) += 1;
        }

        let mut selected = Vec::new();
        for instance in workflow.ready_instances() {
            if selected.len() >= slots {
                break;
            }
            let Some(job) = workflow.job(&instance.job_id) else {
                continue;
            };
            let count = active.entry(instance.job_id.as_str()).or_insert(0);
            if job.max_parallel.is_some_and(|max| *count >= max) {
                continue;
            }
            *count += 1;
            selected.push(instance.id.clone());
        }
        selected
    }

    /// Check if there are more instances to run
    pub fn has_more(&self, workflow: &Workflow) -> bool {
        workflow
            .instances
            .values()
            .any(|i| matches!(i.state, JobState::Pending))
    }
}
