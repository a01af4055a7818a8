//! SQLite checkpoint repository implementation.
//!
//! Implements `CheckpointRepository` from `gantry-core` using sqlx with split
//! read/write pools. Run state (inputs, variables, errors) is stored as JSON
//! text; checkpoints are append-only rows ordered by an autoincrement `seq`.

use chrono::{DateTime, Utc};
use gantry_core::repository::checkpoint::CheckpointRepository;
use gantry_types::error::RepositoryError;
use gantry_types::workflow::{
    Checkpoint, CheckpointStatus, ResourceUsage, RunStatus, StepFailure, WorkflowRun,
};
use serde::de::DeserializeOwned;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointRepository`.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointRepository {
    pool: DatabasePool,
}

impl SqliteCheckpointRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_id: String,
    status: String,
    current_stage: Option<String>,
    inputs: String,
    variables: String,
    errors: String,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            current_stage: row.try_get("current_stage")?,
            inputs: row.try_get("inputs")?,
            variables: row.try_get("variables")?,
            errors: row.try_get("errors")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            status,
            current_stage: self.current_stage,
            inputs: parse_json(&self.inputs, "run inputs")?,
            variables: parse_json(&self.variables, "run variables")?,
            errors: parse_json(&self.errors, "run errors")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct CheckpointRow {
    id: String,
    run_id: String,
    stage: String,
    status: String,
    attempt: i64,
    skipped: bool,
    input: String,
    output: Option<String>,
    error: Option<String>,
    metrics: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            stage: row.try_get("stage")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            skipped: row.try_get("skipped")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            metrics: row.try_get("metrics")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let status: CheckpointStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let output = self
            .output
            .as_deref()
            .map(|s| parse_json(s, "checkpoint output"))
            .transpose()?;
        let error: Option<StepFailure> = self
            .error
            .as_deref()
            .map(|s| parse_json(s, "checkpoint error"))
            .transpose()?;
        let metrics: ResourceUsage = parse_json(&self.metrics, "checkpoint metrics")?;

        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            stage: self.stage,
            status,
            attempt: u32::try_from(self.attempt).unwrap_or_default(),
            skipped: self.skipped,
            input: parse_json(&self.input, "checkpoint input")?,
            output,
            error,
            metrics,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what}: {e}")))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            RepositoryError::NotFound
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

const RUN_COLUMNS: &str =
    "id, workflow_id, status, current_stage, inputs, variables, errors, created_at, updated_at";

// ---------------------------------------------------------------------------
// CheckpointRepository impl
// ---------------------------------------------------------------------------

impl CheckpointRepository for SqliteCheckpointRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, status, current_stage, inputs, variables, errors, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(run.status.as_str())
        .bind(&run.current_stage)
        .bind(to_json(&run.inputs)?)
        .bind(to_json(&run.variables)?)
        .bind(to_json(&run.errors)?)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| {
            RunRow::from_row(&row)
                .map_err(query_err)?
                .into_run()
        })
        .transpose()
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        current_stage: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = ?, current_stage = COALESCE(?, current_stage), updated_at = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(current_stage)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_run_state(
        &self,
        run_id: &Uuid,
        variables: &serde_json::Map<String, serde_json::Value>,
        errors: &[StepFailure],
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET variables = ?, errors = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(variables)?)
        .bind(to_json(errors)?)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = match workflow_id {
            Some(workflow_id) => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? ORDER BY id DESC LIMIT ?"
                ))
                .bind(workflow_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM workflow_runs ORDER BY id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(RunRow::from_row(row).map_err(query_err)?.into_run()?);
        }
        Ok(runs)
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let output = checkpoint.output.as_ref().map(to_json).transpose()?;
        let error = checkpoint.error.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO checkpoints
               (id, run_id, stage, status, attempt, skipped, input, output, error, metrics, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.run_id.to_string())
        .bind(&checkpoint.stage)
        .bind(checkpoint.status.as_str())
        .bind(i64::from(checkpoint.attempt))
        .bind(checkpoint.skipped)
        .bind(to_json(&checkpoint.input)?)
        .bind(output)
        .bind(error)
        .bind(to_json(&checkpoint.metrics)?)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        tracing::trace!(
            run_id = %checkpoint.run_id,
            stage = %checkpoint.stage,
            status = %checkpoint.status,
            "checkpoint written"
        );
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, stage, status, attempt, skipped, input, output, error, metrics, created_at
               FROM checkpoints WHERE run_id = ? ORDER BY seq DESC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            checkpoints.push(CheckpointRow::from_row(row).map_err(query_err)?.into_checkpoint()?);
        }
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::workflow::ErrorKind;
    use serde_json::json;

    async fn test_repo() -> (SqliteCheckpointRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        (SqliteCheckpointRepository::new(pool), dir)
    }

    fn sample_run() -> WorkflowRun {
        let mut inputs = serde_json::Map::new();
        inputs.insert("topic".into(), json!("rust"));
        WorkflowRun::new("digest", inputs)
    }

    fn checkpoint(run_id: Uuid, stage: &str, status: CheckpointStatus) -> Checkpoint {
        Checkpoint {
            id: Uuid::now_v7(),
            run_id,
            stage: stage.to_string(),
            status,
            attempt: 1,
            skipped: false,
            input: json!({"q": stage}),
            output: (status == CheckpointStatus::Success).then(|| json!({"answer": 42})),
            error: (status == CheckpointStatus::Failed)
                .then(|| StepFailure::new(stage, ErrorKind::TransientProvider, "timeout")),
            metrics: ResourceUsage {
                duration_ms: 12,
                tokens_used: 7,
                provider: Some("echo".into()),
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_roundtrip_and_status_update() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run();
        repo.create_run(&run).await.unwrap();

        repo.update_run_status(&run.id, RunStatus::Running, Some("fetch"))
            .await
            .unwrap();
        repo.update_run_status(&run.id, RunStatus::Failed, None)
            .await
            .unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "digest");
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.current_stage.as_deref(), Some("fetch"));
        assert_eq!(loaded.inputs["topic"], json!("rust"));
    }

    #[tokio::test]
    async fn test_save_run_state() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run();
        repo.create_run(&run).await.unwrap();

        let mut variables = serde_json::Map::new();
        variables.insert("summary".into(), json!("done"));
        let errors = vec![StepFailure::new("b", ErrorKind::PermanentProvider, "denied")];
        repo.save_run_state(&run.id, &variables, &errors).await.unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.variables["summary"], json!("done"));
        assert_eq!(loaded.errors, errors);
    }

    #[tokio::test]
    async fn test_missing_run() {
        let (repo, _dir) = test_repo().await;
        let id = Uuid::now_v7();
        assert!(repo.get_run(&id).await.unwrap().is_none());
        assert!(matches!(
            repo.update_run_status(&id, RunStatus::Running, None).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(repo
            .write_checkpoint(&checkpoint(id, "a", CheckpointStatus::Success))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_checkpoints_newest_first() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run();
        repo.create_run(&run).await.unwrap();

        repo.write_checkpoint(&checkpoint(run.id, "fetch", CheckpointStatus::Failed))
            .await
            .unwrap();
        repo.write_checkpoint(&checkpoint(run.id, "fetch", CheckpointStatus::Success))
            .await
            .unwrap();
        repo.write_checkpoint(&checkpoint(run.id, "render", CheckpointStatus::Running))
            .await
            .unwrap();

        let cps = repo.list_checkpoints(&run.id).await.unwrap();
        let statuses: Vec<_> = cps.iter().map(|c| (c.stage.as_str(), c.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("render", CheckpointStatus::Running),
                ("fetch", CheckpointStatus::Success),
                ("fetch", CheckpointStatus::Failed),
            ]
        );
        assert_eq!(cps[1].output, Some(json!({"answer": 42})));
        assert_eq!(cps[2].error.as_ref().unwrap().kind, ErrorKind::TransientProvider);
        assert_eq!(cps[1].metrics.provider.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_limits() {
        let (repo, _dir) = test_repo().await;
        let first = sample_run();
        repo.create_run(&first).await.unwrap();
        let second = sample_run();
        repo.create_run(&second).await.unwrap();
        repo.create_run(&WorkflowRun::new("other", serde_json::Map::new()))
            .await
            .unwrap();

        let digest = repo.list_runs(Some("digest"), 10).await.unwrap();
        assert_eq!(digest.len(), 2);
        assert_eq!(digest[0].id, second.id);
        assert_eq!(repo.list_runs(None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_run_conflicts() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run();
        repo.create_run(&run).await.unwrap();
        assert!(matches!(
            repo.create_run(&run).await,
            Err(RepositoryError::Conflict(_))
        ));
    }
}
