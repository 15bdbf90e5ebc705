use crate::registry::RunDetails;
use crate::JobKind;
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Durable storage for finished runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Stores the full record. Returns whether anything changed.
    async fn save_run(&self, run: &RunDetails) -> Result<bool, Error>;

    /// Versions everything saved for the project since the last commit and returns the commit id.
    async fn commit(&self, project_id: &str, message: &str) -> Result<Option<String>, Error>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunDetails>, Error>;

    async fn runs_for_project(&self, project_id: &str) -> Result<Vec<RunDetails>, Error>;
}

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    project_id: String,
    kind: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    success: Option<bool>,
    progress: f64,
    log: Json<Vec<String>>,
}

impl TryFrom<RunRow> for RunDetails {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(RunDetails {
            run_id: row.run_id,
            project_id: row.project_id,
            kind: row.kind.parse::<JobKind>().map_err(|e| anyhow!(e))?,
            start_time: row.started_at,
            end_time: row.ended_at,
            success: row.success,
            progress: row.progress,
            log: row.log.0,
        })
    }
}

impl DbHandle {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl RunStore for DbHandle {
    async fn save_run(&self, run: &RunDetails) -> Result<bool, Error> {
        debug!(message = "Saving run", run_id = %run.run_id);
        let result = sqlx::query(
            "INSERT INTO import_run \
                (run_id, project_id, kind, started_at, ended_at, success, progress, log) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
            ON CONFLICT (run_id) DO UPDATE SET \
                ended_at = EXCLUDED.ended_at, \
                success = EXCLUDED.success, \
                progress = EXCLUDED.progress, \
                log = EXCLUDED.log, \
                commit_id = NULL \
            WHERE (import_run.ended_at, import_run.success, import_run.progress, import_run.log) \
                IS DISTINCT FROM (EXCLUDED.ended_at, EXCLUDED.success, EXCLUDED.progress, EXCLUDED.log)",
        )
        .bind(run.run_id)
        .bind(&run.project_id)
        .bind(run.kind.as_str())
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.success)
        .bind(run.progress)
        .bind(Json(&run.log))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(&self, project_id: &str, message: &str) -> Result<Option<String>, Error> {
        let mut tx = self.pool.begin().await?;
        let commit_id = Uuid::new_v4();

        let updated = sqlx::query(
            "UPDATE import_run SET commit_id = $1 \
            WHERE project_id = $2 AND commit_id IS NULL",
        )
        .bind(commit_id)
        .bind(project_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            "INSERT INTO import_run_commit (commit_id, project_id, message) \
            VALUES ($1, $2, $3)",
        )
        .bind(commit_id)
        .bind(project_id)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(message = "Committed run history", project_id = project_id, commit_id = %commit_id);
        Ok(Some(commit_id.to_string()))
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunDetails>, Error> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT run_id, project_id, kind, started_at, ended_at, success, progress, log \
            FROM import_run WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(RunDetails::try_from).transpose()
    }

    async fn runs_for_project(&self, project_id: &str) -> Result<Vec<RunDetails>, Error> {
        sqlx::query_as::<_, RunRow>(
            "SELECT run_id, project_id, kind, started_at, ended_at, success, progress, log \
            FROM import_run WHERE project_id = $1 \
            ORDER BY started_at asc",
        )
        .bind(project_id)
        .fetch_all(&*self.pool)
        .await?
        .into_iter()
        .map(RunDetails::try_from)
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub commit_id: String,
    pub project_id: String,
    pub message: String,
    pub runs: Vec<Uuid>,
}

/// Keeps run history in process memory. Used when no database is configured.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, RunDetails>>,
    uncommitted: Mutex<Vec<Uuid>>,
    commits: Mutex<Vec<CommitEntry>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> Vec<CommitEntry> {
        self.commits.lock().clone()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_run(&self, run: &RunDetails) -> Result<bool, Error> {
        let mut runs = self.runs.lock();
        if runs.get(&run.run_id) == Some(run) {
            return Ok(false);
        }
        runs.insert(run.run_id, run.clone());
        let mut uncommitted = self.uncommitted.lock();
        if !uncommitted.contains(&run.run_id) {
            uncommitted.push(run.run_id);
        }
        Ok(true)
    }

    async fn commit(&self, project_id: &str, message: &str) -> Result<Option<String>, Error> {
        let runs = self.runs.lock();
        let mut uncommitted = self.uncommitted.lock();
        let (included, rest): (Vec<Uuid>, Vec<Uuid>) = uncommitted
            .iter()
            .copied()
            .partition(|id| runs.get(id).is_some_and(|r| r.project_id == project_id));
        *uncommitted = rest;
        if included.is_empty() {
            return Ok(None);
        }
        let commit_id = Uuid::new_v4().to_string();
        self.commits.lock().push(CommitEntry {
            commit_id: commit_id.clone(),
            project_id: project_id.to_string(),
            message: message.to_string(),
            runs: included,
        });
        Ok(Some(commit_id))
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunDetails>, Error> {
        Ok(self.runs.lock().get(&run_id).cloned())
    }

    async fn runs_for_project(&self, project_id: &str) -> Result<Vec<RunDetails>, Error> {
        let mut runs: Vec<RunDetails> = self
            .runs
            .lock()
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.start_time);
        Ok(runs)
    }
}
