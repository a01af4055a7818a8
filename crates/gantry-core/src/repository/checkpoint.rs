//! Checkpoint repository trait definition.
//!
//! The engine needs only append/read semantics with a total order per run;
//! no cross-run transactional guarantees are required of implementations.

use gantry_types::error::RepositoryError;
use gantry_types::workflow::{Checkpoint, RunStatus, StepFailure, WorkflowRun};
use uuid::Uuid;

/// Storage interface for runs and their checkpoint logs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a newly created run.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch a run by id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Set a run's status and current stage.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        current_stage: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Store the run's committed variable mapping and error list.
    fn save_run_state(
        &self,
        run_id: &Uuid,
        variables: &serde_json::Map<String, serde_json::Value>,
        errors: &[StepFailure],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Most recent runs first, optionally restricted to one workflow.
    fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Append a checkpoint. Checkpoints are never updated after this call.
    fn write_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All checkpoints of a run, newest first (reverse write order).
    fn list_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;
}
