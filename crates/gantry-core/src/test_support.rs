//! Shared fixtures for engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use gantry_types::config::EngineConfig;
use gantry_types::error::{ProviderError, RepositoryError};
use gantry_types::workflow::{Checkpoint, RunStatus, StepFailure, WorkflowRun};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::provider::{ProviderRegistry, ProviderRequest, StepProvider};
use crate::repository::checkpoint::CheckpointRepository;
use crate::repository::memory::InMemoryCheckpointRepository;
use crate::resilience::{ResilienceRegistry, ResilientDispatcher};

type Script = dyn Fn(&ProviderRequest, u32) -> Result<Value, ProviderError> + Send + Sync;

/// Provider whose outcome is a pure function of the request and call index.
pub struct Scripted {
    name: String,
    calls: Arc<AtomicU32>,
    script: Box<Script>,
}

impl Scripted {
    pub fn new(
        name: &str,
        script: impl Fn(&ProviderRequest, u32) -> Result<Value, ProviderError> + Send + Sync + 'static,
    ) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                name: name.to_string(),
                calls: calls.clone(),
                script: Box::new(script),
            },
            calls,
        )
    }
}

impl StepProvider for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(request, n)
    }
}

/// Configuration with retry delays short enough for real-time tests.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

pub fn dispatcher(config: EngineConfig, providers: ProviderRegistry) -> ResilientDispatcher {
    ResilientDispatcher::new(Arc::new(providers), Arc::new(ResilienceRegistry::new(config)))
}

/// In-memory repository that suspends on every call, like a real database.
/// Checkpoint appends additionally wait `write_delay`.
#[derive(Default)]
pub struct Sluggish {
    inner: InMemoryCheckpointRepository,
    write_delay: Duration,
}

impl Sluggish {
    pub fn new(write_delay: Duration) -> Self {
        Self {
            inner: InMemoryCheckpointRepository::new(),
            write_delay,
        }
    }

    pub fn checkpoint_count(&self) -> usize {
        self.inner.checkpoint_count()
    }
}

impl CheckpointRepository for Sluggish {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        tokio::task::yield_now().await;
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        tokio::task::yield_now().await;
        self.inner.get_run(run_id).await
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        current_stage: Option<&str>,
    ) -> Result<(), RepositoryError> {
        tokio::task::yield_now().await;
        self.inner.update_run_status(run_id, status, current_stage).await
    }

    async fn save_run_state(
        &self,
        run_id: &Uuid,
        variables: &Map<String, Value>,
        errors: &[StepFailure],
    ) -> Result<(), RepositoryError> {
        tokio::task::yield_now().await;
        self.inner.save_run_state(run_id, variables, errors).await
    }

    async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        tokio::task::yield_now().await;
        self.inner.list_runs(workflow_id, limit).await
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        tokio::task::yield_now().await;
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.inner.write_checkpoint(checkpoint).await
    }

    async fn list_checkpoints(&self, run_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        tokio::task::yield_now().await;
        self.inner.list_checkpoints(run_id).await
    }
}
