//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall workflow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Run is currently executing jobs
    Running,
    /// Every job either succeeded or was skipped
    Completed,
    /// At least one job failed
    Failed,
    /// The run was cancelled through its concurrency group
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Running" => RunStatus::Running,
            "Completed" => RunStatus::Completed,
            "Failed" => RunStatus::Failed,
            "Cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Pending,
        }
    }
}

/// State of a single job instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for its `needs` to resolve
    Pending,
    /// Handed to the executor
    Running {
        started_at: DateTime<Utc>,
    },
    /// All steps passed
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// A step failed; later steps did not run
    Failed {
        error: String,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
    /// Never started (condition false or a predecessor did not succeed)
    Skipped {
        reason: String,
    },
    /// Stopped by fail-fast or by a concurrency group
    Cancelled {
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobState {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. }
                | JobState::Failed { .. }
                | JobState::Skipped { .. }
                | JobState::Cancelled { .. }
        )
    }

    /// The `needs.<job>.result` value for a terminal state
    pub fn result(&self) -> Option<JobResult> {
        match self {
            JobState::Completed { .. } => Some(JobResult::Success),
            JobState::Failed { .. } => Some(JobResult::Failure),
            JobState::Skipped { .. } => Some(JobResult::Skipped),
            JobState::Cancelled { .. } => Some(JobResult::Cancelled),
            JobState::Pending | JobState::Running { .. } => None,
        }
    }
}

/// Aggregated result of a job across its matrix instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::Failure => "failure",
            JobResult::Cancelled => "cancelled",
            JobResult::Skipped => "skipped",
        }
    }

    /// Combine per-instance results: any failure wins, then cancellation,
    /// then success; a job is skipped only if every instance was skipped.
    pub fn combine<I: IntoIterator<Item = JobResult>>(results: I) -> Option<JobResult> {
        let mut combined: Option<JobResult> = None;
        for result in results {
            combined = Some(match (combined, result) {
                (None, r) => r,
                (Some(JobResult::Failure), _) | (_, JobResult::Failure) => JobResult::Failure,
                (Some(JobResult::Cancelled), _) | (_, JobResult::Cancelled) => JobResult::Cancelled,
                (Some(JobResult::Success), _) | (_, JobResult::Success) => JobResult::Success,
                (Some(JobResult::Skipped), JobResult::Skipped) => JobResult::Skipped,
            });
        }
        combined
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Current run status
    pub status: RunStatus,

    /// When the run started
    pub started_at: Option<DateTime<Utc>>,

    /// When the run finished
    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of job instances
    pub total_jobs: usize,

    /// Number of succeeded job instances
    pub completed_jobs: usize,

    /// Number of failed or cancelled job instances
    pub failed_jobs: usize,

    /// Number of skipped job instances
    pub skipped_jobs: usize,

    /// Number of currently running job instances
    pub running_jobs: usize,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            skipped_jobs: 0,
            running_jobs: 0,
        }
    }

    /// Mark run as started
    pub fn start(&mut self, total_jobs: usize) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_jobs = total_jobs;
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Fraction of job instances in a terminal state (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        (self.completed_jobs + self.failed_jobs + self.skipped_jobs) as f64 / self.total_jobs as f64
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
