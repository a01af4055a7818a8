//! Engine events published while a run executes.
//!
//! Subscribers (CLI progress output, audit sinks) receive these over the core
//! event bus. Events describe what already happened; they never drive the run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ErrorKind, RunStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        /// Number of stage groups scheduled (after skipping satisfied groups on resume).
        stage_groups: usize,
        resumed: bool,
    },
    StepStarted {
        run_id: Uuid,
        stage: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: Uuid,
        stage: String,
        attempt: u32,
        provider: String,
        duration_ms: u64,
    },
    StepSkipped {
        run_id: Uuid,
        stage: String,
    },
    StepFailed {
        run_id: Uuid,
        stage: String,
        attempt: u32,
        kind: ErrorKind,
        message: String,
        /// Whether another attempt will follow.
        will_retry: bool,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        error_count: usize,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}
