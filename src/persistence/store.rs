//! SQLite-based run history

use crate::core::RunStatus;
use crate::persistence::{PersistenceBackend, RunSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

const COLUMNS: &str = "id, workflow, event, git_ref, status, started_at, completed_at, progress, \
                       succeeded_jobs, failed_jobs, skipped_jobs, total_jobs, environment_urls";

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: &str) -> Result<Self> {
        let url = if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", db_path)
        };
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("Failed to open run history at {}", db_path))?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store under the user's data directory
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("stagegate");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;

        Self::open(&db_dir.join("runs.db")).await
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let db_path = path
            .to_str()
            .with_context(|| format!("Database path is not valid UTF-8: {}", path.display()))?;
        Self::new(db_path).await
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workflow TEXT NOT NULL,
                event TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                progress REAL NOT NULL DEFAULT 0.0,
                succeeded_jobs INTEGER NOT NULL DEFAULT 0,
                failed_jobs INTEGER NOT NULL DEFAULT 0,
                skipped_jobs INTEGER NOT NULL DEFAULT 0,
                total_jobs INTEGER NOT NULL DEFAULT 0,
                environment_urls TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize run history")?;

        Ok(())
    }

    fn from_row(row: &SqliteRow) -> Result<RunSummary> {
        let urls: String = row.get("environment_urls");
        Ok(RunSummary {
            execution_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            workflow: row.get("workflow"),
            event: row.get("event"),
            git_ref: row.get("git_ref"),
            status: RunStatus::parse(&row.get::<String, _>("status")),
            started_at: from_naive(row.get("started_at")),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(from_naive),
            progress: row.get("progress"),
            succeeded_jobs: row.get::<i64, _>("succeeded_jobs") as usize,
            failed_jobs: row.get::<i64, _>("failed_jobs") as usize,
            skipped_jobs: row.get::<i64, _>("skipped_jobs") as usize,
            total_jobs: row.get::<i64, _>("total_jobs") as usize,
            environment_urls: serde_json::from_str(&urls)
                .context("Corrupt environment URLs in run history")?,
        })
    }
}

fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, workflow, event, git_ref, status, started_at, completed_at, progress,
             succeeded_jobs, failed_jobs, skipped_jobs, total_jobs, environment_urls)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(run.execution_id.to_string())
        .bind(&run.workflow)
        .bind(&run.event)
        .bind(&run.git_ref)
        .bind(run.status.as_str())
        .bind(run.started_at.naive_utc())
        .bind(run.completed_at.map(|dt| dt.naive_utc()))
        .bind(run.progress)
        .bind(run.succeeded_jobs as i64)
        .bind(run.failed_jobs as i64)
        .bind(run.skipped_jobs as i64)
        .bind(run.total_jobs as i64)
        .bind(serde_json::to_string(&run.environment_urls)?)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, execution_id: Uuid) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", COLUMNS))
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE workflow = ?1 ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(workflow)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn get_latest_run(&self, workflow: &str) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE workflow = ?1 ORDER BY started_at DESC LIMIT 1",
            COLUMNS
        ))
        .bind(workflow)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get latest run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn delete_run(&self, execution_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM runs WHERE id = ?1")
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete run")?;

        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT workflow FROM runs ORDER BY workflow ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list workflows")?;

        Ok(rows.iter().map(|row| row.get("workflow")).collect())
    }
}
