//! Process-local repository implementations.
//!
//! Useful for embedding the engine without a database and for tests. State is
//! lost when the process exits, so resume only works within one process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use gantry_types::error::RepositoryError;
use gantry_types::workflow::{Checkpoint, RunStatus, StepFailure, WorkflowRun};
use tokio::time::Instant;
use uuid::Uuid;

use super::checkpoint::CheckpointRepository;
use super::rate_limit::{RateLimitDecision, RateLimitStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Store {
    runs: HashMap<Uuid, WorkflowRun>,
    /// Per-run checkpoints in write order.
    checkpoints: HashMap<Uuid, Vec<Checkpoint>>,
}

/// In-memory `CheckpointRepository`.
#[derive(Default)]
pub struct InMemoryCheckpointRepository {
    store: Mutex<Store>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total checkpoints written across all runs.
    pub fn checkpoint_count(&self) -> usize {
        lock(&self.store).checkpoints.values().map(Vec::len).sum()
    }
}

impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut store = lock(&self.store);
        if store.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        }
        store.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(lock(&self.store).runs.get(run_id).cloned())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        current_stage: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut store = lock(&self.store);
        let run = store.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        run.status = status;
        if let Some(stage) = current_stage {
            run.current_stage = Some(stage.to_string());
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn save_run_state(
        &self,
        run_id: &Uuid,
        variables: &serde_json::Map<String, serde_json::Value>,
        errors: &[StepFailure],
    ) -> Result<(), RepositoryError> {
        let mut store = lock(&self.store);
        let run = store.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        run.variables = variables.clone();
        run.errors = errors.to_vec();
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let store = lock(&self.store);
        let mut runs: Vec<WorkflowRun> = store
            .runs
            .values()
            .filter(|r| workflow_id.is_none_or(|w| r.workflow_id == w))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let mut store = lock(&self.store);
        if !store.runs.contains_key(&checkpoint.run_id) {
            return Err(RepositoryError::NotFound);
        }
        store
            .checkpoints
            .entry(checkpoint.run_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let store = lock(&self.store);
        Ok(store
            .checkpoints
            .get(run_id)
            .map(|cps| cps.iter().rev().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// In-memory sliding-window `RateLimitStore`.
///
/// Shared by every limiter holding the same instance, so it stands in for the
/// database-backed store when several engines run in one process.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    async fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateLimitDecision, RepositoryError> {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let hits = windows.entry(key.to_string()).or_default();
        while hits.front().is_some_and(|t| now.duration_since(*t) >= window) {
            hits.pop_front();
        }

        let allowed = hits.len() < limit as usize;
        if allowed {
            hits.push_back(now);
        }
        Ok(RateLimitDecision {
            allowed,
            current_count: hits.len() as u64,
        })
    }
}
