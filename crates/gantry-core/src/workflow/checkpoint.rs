//! Durable checkpoint manager for workflow runs.
//!
//! Wraps `CheckpointRepository` with the run-level API the executor needs:
//! append one immutable checkpoint per step attempt, keep the run record in
//! step with committed progress, and rebuild the state a resumed run starts
//! from.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use gantry_types::workflow::{
    Checkpoint, CheckpointStatus, ResourceUsage, RunStatus, StepFailure, WorkflowDefinition,
    WorkflowRun,
};
use serde_json::Value;
use uuid::Uuid;

use super::dag::ExecutionPlan;
use super::variables::Variables;
use crate::repository::checkpoint::CheckpointRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `R: CheckpointRepository` so the same manager runs against
/// SQLite or the in-memory repository used in tests.
#[derive(Debug)]
pub struct CheckpointManager<R: CheckpointRepository> {
    repo: R,
}

/// State a resumed run starts from.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    /// Stage of the most recent successful checkpoint, if any.
    pub resume_point: Option<String>,
    /// Stages that will not run again.
    pub satisfied: HashSet<String>,
    /// Run inputs plus the outputs of every satisfied stage.
    pub variables: Variables,
    /// Failures recorded earlier for stages that will not run again.
    pub errors: Vec<StepFailure>,
    /// Tokens consumed by every earlier attempt.
    pub tokens_used: u64,
}

/// What one attempt is about to record.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub run_id: Uuid,
    pub stage: String,
    pub attempt: u32,
    pub input: Value,
}

impl AttemptRecord {
    fn checkpoint(
        &self,
        status: CheckpointStatus,
        output: Option<Value>,
        error: Option<StepFailure>,
        metrics: ResourceUsage,
    ) -> Checkpoint {
        Checkpoint {
            id: Uuid::now_v7(),
            run_id: self.run_id,
            stage: self.stage.clone(),
            status,
            attempt: self.attempt,
            skipped: false,
            input: self.input.clone(),
            output,
            error,
            metrics,
            created_at: Utc::now(),
        }
    }
}

impl<R: CheckpointRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Run-level records
    // -----------------------------------------------------------------------

    pub async fn create_run(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        self.repo.create_run(run).await.map_err(repo_err)?;
        tracing::debug!(run_id = %run.id, workflow = %run.workflow_id, "created run");
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(repo_err)?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, CheckpointError> {
        self.repo.list_runs(workflow_id, limit).await.map_err(repo_err)
    }

    pub async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        current_stage: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.repo
            .update_run_status(&run_id, status, current_stage)
            .await
            .map_err(repo_err)?;
        tracing::debug!(run_id = %run_id, status = %status, "checkpointed run status");
        Ok(())
    }

    /// Persist the committed variable mapping and error list.
    pub async fn save_progress(
        &self,
        run_id: Uuid,
        variables: &Variables,
        errors: &[StepFailure],
    ) -> Result<(), CheckpointError> {
        self.repo
            .save_run_state(&run_id, variables.as_map(), errors)
            .await
            .map_err(repo_err)
    }

    // -----------------------------------------------------------------------
    // Attempt-level checkpoints
    // -----------------------------------------------------------------------

    pub async fn record_success(
        &self,
        record: &AttemptRecord,
        output: Value,
        metrics: ResourceUsage,
    ) -> Result<(), CheckpointError> {
        self.write(record.checkpoint(CheckpointStatus::Success, Some(output), None, metrics))
            .await
    }

    /// Record a failed attempt. `output` keeps a raw result that failed its
    /// output contract.
    pub async fn record_failure(
        &self,
        record: &AttemptRecord,
        error: StepFailure,
        output: Option<Value>,
        metrics: ResourceUsage,
    ) -> Result<(), CheckpointError> {
        self.write(record.checkpoint(CheckpointStatus::Failed, output, Some(error), metrics))
            .await
    }

    /// Record a step whose condition was false.
    pub async fn record_skipped(&self, record: &AttemptRecord) -> Result<(), CheckpointError> {
        let mut checkpoint =
            record.checkpoint(CheckpointStatus::Success, None, None, ResourceUsage::default());
        checkpoint.skipped = true;
        self.write(checkpoint).await
    }

    /// Record an attempt that stopped without reaching an outcome.
    pub async fn record_abandoned(
        &self,
        record: &AttemptRecord,
        metrics: ResourceUsage,
    ) -> Result<(), CheckpointError> {
        self.write(record.checkpoint(CheckpointStatus::Running, None, None, metrics))
            .await
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        self.repo.write_checkpoint(&checkpoint).await.map_err(repo_err)?;
        tracing::debug!(
            run_id = %checkpoint.run_id,
            step_id = %checkpoint.stage,
            attempt = checkpoint.attempt,
            status = %checkpoint.status,
            skipped = checkpoint.skipped,
            "checkpoint written"
        );
        Ok(())
    }

    /// A run's checkpoints, newest first.
    pub async fn list_checkpoints(&self, run_id: Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.repo.list_checkpoints(&run_id).await.map_err(repo_err)
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Rebuild the starting state of a resumed run.
    ///
    /// The resume point is the stage of the newest `success` checkpoint. Every
    /// stage in a group before the resume point's group is satisfied, as is
    /// any stage with its own success checkpoint. The fresh variable mapping
    /// is the run's inputs plus each satisfied stage's last successful output.
    pub async fn restore(
        &self,
        run: &WorkflowRun,
        def: &WorkflowDefinition,
        plan: &ExecutionPlan,
    ) -> Result<ResumeState, CheckpointError> {
        let checkpoints = self.list_checkpoints(run.id).await?;

        let tokens_used = checkpoints.iter().map(|c| c.metrics.tokens_used).sum();

        let mut last_success: HashMap<&str, &Checkpoint> = HashMap::new();
        for checkpoint in &checkpoints {
            if checkpoint.status == CheckpointStatus::Success {
                last_success.entry(checkpoint.stage.as_str()).or_insert(checkpoint);
            }
        }

        let resume_point = checkpoints
            .iter()
            .find(|c| c.status == CheckpointStatus::Success)
            .map(|c| c.stage.clone());

        let mut satisfied: HashSet<String> =
            last_success.keys().map(|stage| stage.to_string()).collect();
        if let Some(group) = resume_point.as_deref().and_then(|stage| plan.group_of(stage)) {
            satisfied.extend(plan.groups[..group].iter().flatten().cloned());
        }

        let mut variables = Variables::from_map(run.inputs.clone());
        for stage in plan.groups.iter().flatten() {
            if !satisfied.contains(stage) {
                continue;
            }
            let (Some(step), Some(checkpoint)) = (def.step(stage), last_success.get(stage.as_str()))
            else {
                continue;
            };
            if let Some(output) = &checkpoint.output {
                variables.merge_step_outputs(step, output);
            }
        }

        let errors = run
            .errors
            .iter()
            .filter(|e| satisfied.contains(&e.stage))
            .cloned()
            .collect();

        tracing::info!(
            run_id = %run.id,
            resume_point = resume_point.as_deref().unwrap_or("<none>"),
            satisfied = satisfied.len(),
            "restored run state"
        );

        Ok(ResumeState {
            resume_point,
            satisfied,
            variables,
            errors,
            tokens_used,
        })
    }
}

fn repo_err(e: gantry_types::error::RepositoryError) -> CheckpointError {
    CheckpointError::Repository(e.to_string())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
