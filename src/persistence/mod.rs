//! Persistence layer for workflow run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{JobState, RunStatus, TriggerEvent, Workflow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a finished workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub execution_id: Uuid,

    pub workflow: String,

    /// Event name that started the run
    pub event: String,

    pub git_ref: String,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    pub succeeded_jobs: usize,

    pub failed_jobs: usize,

    pub skipped_jobs: usize,

    pub total_jobs: usize,

    /// Environment URLs reported by deploy jobs, by instance ID
    #[serde(default)]
    pub environment_urls: HashMap<String, String>,
}

impl RunSummary {
    /// Summarize a workflow after `event` ran it
    pub fn from_run(workflow: &Workflow, event: &TriggerEvent) -> Self {
        let environment_urls = workflow
            .instances
            .values()
            .filter(|i| matches!(i.state, JobState::Completed { .. }))
            .filter_map(|i| i.environment_url.clone().map(|url| (i.id.clone(), url)))
            .collect();

        Self {
            execution_id: workflow.state.execution_id,
            workflow: workflow.name.clone(),
            event: event.kind.to_string(),
            git_ref: event.git_ref.clone(),
            status: workflow.state.status,
            started_at: workflow.state.started_at.unwrap_or_else(Utc::now),
            completed_at: workflow.state.completed_at,
            progress: workflow.state.progress(),
            succeeded_jobs: workflow.state.completed_jobs,
            failed_jobs: workflow.state.failed_jobs,
            skipped_jobs: workflow.state.skipped_jobs,
            total_jobs: workflow.state.total_jobs,
            environment_urls,
        }
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, execution_id: Uuid) -> Result<Option<RunSummary>>;

    /// List runs of a workflow, newest first
    async fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>>;

    /// Most recent run of a workflow
    async fn get_latest_run(&self, workflow: &str) -> Result<Option<RunSummary>>;

    async fn delete_run(&self, execution_id: Uuid) -> Result<()>;

    /// Names of every workflow with recorded runs
    async fn list_workflows(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<Uuid, RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.execution_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, execution_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&execution_id).cloned())
    }

    async fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut result: Vec<RunSummary> = runs
            .values()
            .filter(|r| r.workflow == workflow)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn get_latest_run(&self, workflow: &str) -> Result<Option<RunSummary>> {
        Ok(self.list_runs(workflow).await?.into_iter().next())
    }

    async fn delete_run(&self, execution_id: Uuid) -> Result<()> {
        self.runs.write().await.remove(&execution_id);
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|r| r.workflow.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
