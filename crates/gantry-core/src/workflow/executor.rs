//! Graph executor: stage-group execution with durable checkpointing.
//!
//! `GraphExecutor` walks a run's stage groups in order. Steps within a group
//! run concurrently via `tokio::JoinSet`, each against a snapshot of the
//! variable mapping; only the executor merges their outputs, once the whole
//! group has settled.
//!
//! # Execution flow
//!
//! 1. Validate the definition, build the plan, resolve inputs.
//! 2. Create the run record (or restore state for resume).
//! 3. Before each group: honour cancel/pause, the run deadline and the token budget.
//! 4. Spawn the group's unsatisfied steps and wait for every one to settle.
//! 5. Merge outputs in step-id order, persist progress, stop on an aborting failure.
//! 6. Record the final status and return a `RunReport`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gantry_types::event::EngineEvent;
use gantry_types::workflow::{
    ErrorKind, OnFailure, RunStatus, StepFailure, WorkflowDefinition, WorkflowRun,
};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager, ResumeState};
use super::dag::{ExecutionPlan, build_execution_plan};
use super::definition::{WorkflowError, resolve_inputs, validate_definition};
use super::step_runner::{StepResult, StepRunner, StepStatus};
use super::variables::Variables;
use crate::contract::ContractRegistry;
use crate::event::EventBus;
use crate::repository::checkpoint::CheckpointRepository;
use crate::resilience::ResilientDispatcher;

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT for async methods, consistent with the repository traits.
pub trait WorkflowExecutor: Send + Sync {
    /// Execute a workflow definition from the beginning.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<RunReport, ExecutorError>> + Send;

    /// Resume a failed or paused run from its checkpoints.
    fn resume(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<RunReport, ExecutorError>> + Send;

    /// Request cancellation. Returns false when the run already finished.
    fn cancel(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<bool, ExecutorError>> + Send;

    /// Request a pause at the next stage-group boundary. Returns false when
    /// the run is not executing in this process.
    fn pause(&self, run_id: Uuid) -> bool;
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Outcome of one `execute` or `resume` call.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    /// Final committed variable mapping.
    pub variables: Variables,
    /// Values of the workflow's declared outputs that were produced.
    pub outputs: Map<String, Value>,
    /// Every step failure of the run, including ones carried over from before a resume.
    pub errors: Vec<StepFailure>,
    /// Steps executed by this call, in completion order by group.
    pub steps: Vec<StepResult>,
    pub last_successful_stage: Option<String>,
    pub total_tokens: u64,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn step(&self, stage: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.stage == stage)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The definition or inputs are invalid. Nothing was executed.
    #[error(transparent)]
    Validation(#[from] WorkflowError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: Uuid, status: RunStatus },

    #[error("run {run_id} executes workflow '{expected}', not '{actual}'")]
    WorkflowMismatch {
        run_id: Uuid,
        expected: String,
        actual: String,
    },
}

// ---------------------------------------------------------------------------
// GraphExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RunControl {
    cancel: CancellationToken,
    pause: AtomicBool,
}

/// A claimed slot in the active-run table, released on drop.
struct ActiveRun<'a> {
    active: &'a DashMap<Uuid, Arc<RunControl>>,
    run_id: Uuid,
    control: Arc<RunControl>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

/// Stage-group executor with durable checkpointing.
///
/// Generic over `R: CheckpointRepository` for storage flexibility.
pub struct GraphExecutor<R: CheckpointRepository + 'static> {
    checkpoints: Arc<CheckpointManager<R>>,
    runner: Arc<StepRunner<R>>,
    events: EventBus,
    /// Control handles of runs executing in this process, keyed by run id.
    active: DashMap<Uuid, Arc<RunControl>>,
}

impl<R: CheckpointRepository + 'static> GraphExecutor<R> {
    pub fn new(
        repo: R,
        dispatcher: ResilientDispatcher,
        contracts: Arc<ContractRegistry>,
        events: EventBus,
    ) -> Self {
        let checkpoints = Arc::new(CheckpointManager::new(repo));
        let runner = Arc::new(StepRunner::new(
            dispatcher,
            contracts,
            checkpoints.clone(),
            events.clone(),
        ));
        Self {
            checkpoints,
            runner,
            events,
            active: DashMap::new(),
        }
    }

    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoints
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Whether the run is executing in this process.
    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active.contains_key(&run_id)
    }

    /// Claim `run_id` for this process. `None` when it is already executing.
    fn claim(&self, run_id: Uuid) -> Option<ActiveRun<'_>> {
        match self.active.entry(run_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let control = Arc::new(RunControl::default());
                slot.insert(control.clone());
                Some(ActiveRun {
                    active: &self.active,
                    run_id,
                    control,
                })
            }
        }
    }

    fn prepare(def: &WorkflowDefinition) -> Result<ExecutionPlan, ExecutorError> {
        validate_definition(def)?;
        Ok(build_execution_plan(&def.steps)?)
    }

    async fn drive(
        &self,
        def: &WorkflowDefinition,
        plan: &ExecutionPlan,
        run_id: Uuid,
        state: ResumeState,
        resumed: bool,
        slot: ActiveRun<'_>,
    ) -> Result<RunReport, ExecutorError> {
        let span = tracing::info_span!("workflow_run", run_id = %run_id, workflow = %def.name);
        let result = self
            .drive_groups(def, plan, run_id, state, resumed, &slot.control)
            .instrument(span)
            .await;

        drop(slot);
        if result.is_err() {
            if let Err(e) = self.checkpoints.update_status(run_id, RunStatus::Failed, None).await {
                tracing::error!(run_id = %run_id, error = %e, "failed to mark run failed");
            }
        }
        result
    }

    async fn drive_groups(
        &self,
        def: &WorkflowDefinition,
        plan: &ExecutionPlan,
        run_id: Uuid,
        state: ResumeState,
        resumed: bool,
        control: &RunControl,
    ) -> Result<RunReport, ExecutorError> {
        let ResumeState {
            resume_point,
            satisfied,
            mut variables,
            mut errors,
            tokens_used: mut total_tokens,
        } = state;

        let pending: Vec<Vec<&str>> = plan
            .groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(String::as_str)
                    .filter(|id| !satisfied.contains(*id))
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect();

        self.checkpoints
            .update_status(run_id, RunStatus::Running, None)
            .await?;
        self.events.publish(EngineEvent::RunStarted {
            run_id,
            workflow: def.name.clone(),
            stage_groups: pending.len(),
            resumed,
        });
        tracing::info!(
            run_id = %run_id,
            groups = pending.len(),
            skipped_stages = satisfied.len(),
            resumed,
            "run started"
        );

        let deadline = tokio::time::Instant::now() + def.timeout();
        let mut last_success = resume_point;
        let mut steps = Vec::new();
        let mut status = RunStatus::Completed;

        for (index, group) in pending.iter().enumerate() {
            if control.cancel.is_cancelled() {
                tracing::info!(run_id = %run_id, "run cancelled");
                status = RunStatus::Cancelled;
                break;
            }
            if control.pause.load(Ordering::Acquire) {
                tracing::info!(run_id = %run_id, "run paused");
                status = RunStatus::Paused;
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                errors.push(timeout_failure(def));
                status = RunStatus::Failed;
                break;
            }
            if total_tokens > def.token_budget {
                tracing::error!(
                    run_id = %run_id,
                    used = total_tokens,
                    budget = def.token_budget,
                    "token budget exceeded"
                );
                errors.push(StepFailure::new(
                    &def.name,
                    ErrorKind::Execution,
                    format!(
                        "token budget exceeded: used {total_tokens} of {}",
                        def.token_budget
                    ),
                ));
                status = RunStatus::Failed;
                break;
            }

            tracing::debug!(run_id = %run_id, group = index, steps = ?group, "dispatching stage group");

            let mut join_set = JoinSet::new();
            let mut task_stages = HashMap::new();
            for id in group {
                let Some(step) = def.step(id) else {
                    continue;
                };
                let step = step.clone();
                let runner = Arc::clone(&self.runner);
                let snapshot = variables.clone();
                let handle =
                    join_set.spawn(async move { runner.run(run_id, &step, &snapshot).await });
                task_stages.insert(handle.id(), id.to_string());
            }

            let mut outcomes = Vec::with_capacity(group.len());
            let settled = tokio::time::timeout_at(deadline, async {
                while let Some(joined) = join_set.join_next_with_id().await {
                    match joined {
                        Ok((_, Ok(result))) => outcomes.push(result),
                        Ok((_, Err(e))) => return Err(e),
                        Err(join_error) => {
                            let stage = task_stages
                                .get(&join_error.id())
                                .cloned()
                                .unwrap_or_default();
                            tracing::error!(
                                run_id = %run_id,
                                step_id = %stage,
                                error = %join_error,
                                "step task failed"
                            );
                            let failure = StepFailure::new(
                                &stage,
                                ErrorKind::Execution,
                                format!("step task failed: {join_error}"),
                            );
                            outcomes.push(StepResult::failed(&stage, failure, 1, 0, 0));
                        }
                    }
                }
                Ok(())
            })
            .await;

            let timed_out = match settled {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    join_set.shutdown().await;
                    return Err(e.into());
                }
                Err(_) => {
                    join_set.shutdown().await;
                    errors.push(timeout_failure(def));
                    true
                }
            };

            outcomes.sort_by(|a, b| a.stage.cmp(&b.stage));
            let mut abort = false;
            for result in outcomes {
                total_tokens += result.tokens_used;
                match result.status {
                    StepStatus::Succeeded => {
                        if let (Some(step), Some(output)) = (def.step(&result.stage), &result.output) {
                            variables.merge_step_outputs(step, output);
                        }
                        last_success = Some(result.stage.clone());
                    }
                    StepStatus::Skipped => {}
                    StepStatus::Failed => {
                        if let Some(failure) = &result.failure {
                            errors.push(failure.clone());
                        }
                        let policy = def
                            .step(&result.stage)
                            .map(|s| s.on_failure)
                            .unwrap_or_default();
                        if policy == OnFailure::Skip {
                            tracing::warn!(
                                run_id = %run_id,
                                step_id = %result.stage,
                                "step failed, continuing without its outputs"
                            );
                        } else {
                            abort = true;
                        }
                    }
                }
                steps.push(result);
            }

            self.checkpoints
                .save_progress(run_id, &variables, &errors)
                .await?;
            self.checkpoints
                .update_status(run_id, RunStatus::Running, last_success.as_deref())
                .await?;

            if timed_out || abort {
                tracing::error!(run_id = %run_id, group = index, timed_out, "aborting run");
                status = RunStatus::Failed;
                break;
            }
        }

        self.checkpoints
            .save_progress(run_id, &variables, &errors)
            .await?;
        self.checkpoints
            .update_status(run_id, status, last_success.as_deref())
            .await?;
        self.events.publish(EngineEvent::RunFinished {
            run_id,
            status,
            error_count: errors.len(),
        });
        tracing::info!(
            run_id = %run_id,
            status = %status,
            errors = errors.len(),
            tokens = total_tokens,
            "run finished"
        );

        let outputs = def
            .outputs
            .iter()
            .filter_map(|name| variables.get(name).map(|v| (name.clone(), v.clone())))
            .collect();

        let mut warnings = plan.warnings();
        if status == RunStatus::Completed && !errors.is_empty() {
            warnings.push(format!(
                "run completed with {} step failure(s)",
                errors.len()
            ));
        }

        Ok(RunReport {
            run_id,
            workflow: def.name.clone(),
            status,
            variables,
            outputs,
            errors,
            steps,
            last_successful_stage: last_success,
            total_tokens,
            warnings,
        })
    }
}

fn timeout_failure(def: &WorkflowDefinition) -> StepFailure {
    StepFailure::new(
        &def.name,
        ErrorKind::Execution,
        format!("workflow timed out after {}s", def.timeout_seconds),
    )
}

impl<R: CheckpointRepository + 'static> WorkflowExecutor for GraphExecutor<R> {
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<RunReport, ExecutorError> {
        let plan = Self::prepare(definition)?;
        let inputs = resolve_inputs(definition, inputs)?;

        let run = WorkflowRun::new(&definition.name, inputs);
        let Some(slot) = self.claim(run.id) else {
            return Err(ExecutorError::NotResumable {
                run_id: run.id,
                status: RunStatus::Running,
            });
        };
        self.checkpoints.create_run(&run).await?;
        tracing::info!(run_id = %run.id, workflow = %definition.name, "starting workflow execution");

        let state = ResumeState {
            variables: Variables::from_map(run.inputs.clone()),
            ..ResumeState::default()
        };
        self.drive(definition, &plan, run.id, state, false, slot).await
    }

    async fn resume(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<RunReport, ExecutorError> {
        // Claimed before the first await so concurrent resumes of one run
        // cannot both pass the status check.
        let Some(slot) = self.claim(run_id) else {
            return Err(ExecutorError::NotResumable {
                run_id,
                status: RunStatus::Running,
            });
        };
        let run = match self.checkpoints.get_run(run_id).await {
            Ok(run) => run,
            Err(CheckpointError::RunNotFound(id)) => return Err(ExecutorError::RunNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if run.workflow_id != definition.name {
            return Err(ExecutorError::WorkflowMismatch {
                run_id,
                expected: run.workflow_id,
                actual: definition.name.clone(),
            });
        }
        if !run.status.is_resumable() {
            return Err(ExecutorError::NotResumable {
                run_id,
                status: run.status,
            });
        }

        let plan = Self::prepare(definition)?;
        let state = self.checkpoints.restore(&run, definition, &plan).await?;
        tracing::info!(
            run_id = %run_id,
            resume_point = state.resume_point.as_deref().unwrap_or("<start>"),
            "resuming workflow run"
        );
        self.drive(definition, &plan, run_id, state, true, slot).await
    }

    async fn cancel(&self, run_id: Uuid) -> Result<bool, ExecutorError> {
        if let Some(control) = self.active.get(&run_id) {
            control.cancel.cancel();
            tracing::info!(run_id = %run_id, "cancellation requested");
            return Ok(true);
        }

        let run = match self.checkpoints.get_run(run_id).await {
            Ok(run) => run,
            Err(CheckpointError::RunNotFound(id)) => return Err(ExecutorError::RunNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if run.status.is_terminal() {
            return Ok(false);
        }
        self.checkpoints
            .update_status(run_id, RunStatus::Cancelled, None)
            .await?;
        self.events.publish(EngineEvent::RunFinished {
            run_id,
            status: RunStatus::Cancelled,
            error_count: run.errors.len(),
        });
        tracing::info!(run_id = %run_id, previous = %run.status, "run cancelled");
        Ok(true)
    }

    fn pause(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(control) => {
                control.pause.store(true, Ordering::Release);
                tracing::info!(run_id = %run_id, "pause requested");
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderRegistry, ProviderRequest, StepProvider};
    use crate::repository::memory::InMemoryCheckpointRepository;
    use crate::test_support::{Scripted, dispatcher, fast_config};
    use crate::workflow::definition::parse_workflow_yaml;
    use gantry_types::contract::Contract;
    use gantry_types::error::ProviderError;
    use gantry_types::workflow::CheckpointStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use tokio::sync::Semaphore;

    type Executor = GraphExecutor<InMemoryCheckpointRepository>;

    fn executor(providers: ProviderRegistry) -> Executor {
        executor_with(providers, ContractRegistry::new())
    }

    fn executor_with(providers: ProviderRegistry, contracts: ContractRegistry) -> Executor {
        GraphExecutor::new(
            InMemoryCheckpointRepository::new(),
            dispatcher(fast_config(), providers),
            Arc::new(contracts),
            EventBus::default(),
        )
    }

    /// Echo-like provider that counts calls per stage.
    fn counting() -> (Scripted, Arc<AtomicU32>) {
        Scripted::new("work", |request, _| Ok(Value::Object(request.params.clone())))
    }

    const DIAMOND: &str = r#"
name: diamond
outputs: [d]
steps:
  - id: A
    type: echo
    params: {a: "from A"}
    outputs: [a]
  - id: B
    type: fragile
    depends_on: A
    on_failure: skip
    outputs: [b]
  - id: C
    type: echo
    depends_on: A
    params: {c: "${a} then C"}
    outputs: [c]
  - id: D
    type: echo
    depends_on: [B, C]
    params: {d: "${A.a} + ${c}"}
    outputs: [d]
"#;

    fn fragile_providers() -> (ProviderRegistry, Arc<AtomicU32>) {
        let (fragile, calls) =
            Scripted::new("fragile", |_, _| Err(ProviderError::permanent("forbidden")));
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(fragile);
        (providers, calls)
    }

    #[tokio::test]
    async fn test_diamond_skip_failure_completes_with_errors() {
        let (providers, _) = fragile_providers();
        let exec = executor(providers);
        let def = parse_workflow_yaml(DIAMOND).unwrap();
        let mut events = exec.events().subscribe();

        let report = exec.execute(&def, Map::new()).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, "B");
        assert_eq!(report.errors[0].kind, ErrorKind::PermanentProvider);
        assert_eq!(report.errors[0].providers_attempted, vec!["fragile"]);
        assert_eq!(report.outputs["d"], json!("from A + from A then C"));
        assert!(!report.variables.contains("b"));
        assert_eq!(report.last_successful_stage.as_deref(), Some("D"));
        assert!(report.warnings.iter().any(|w| w.contains("1 step failure")));

        let order: Vec<&str> = report.steps.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C", "D"]);

        let run = exec.checkpoints().get_run(report.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.errors.len(), 1);

        let first = events.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::RunStarted { stage_groups: 3, resumed: false, .. }));
        let mut last = first;
        while let Ok(event) = events.try_recv() {
            last = event;
        }
        assert!(matches!(
            last,
            EngineEvent::RunFinished { status: RunStatus::Completed, error_count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_checkpoint() {
        let (provider, calls) = counting();
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let exec = executor(providers);
        let def: WorkflowDefinition = serde_yaml_ng::from_str(
            r#"
name: loop
steps:
  - {id: a, type: work, depends_on: c}
  - {id: b, type: work, depends_on: a}
  - {id: c, type: work, depends_on: b}
"#,
        )
        .unwrap();

        let err = exec.execute(&def, Map::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Validation(WorkflowError::CycleDetected { ref steps }) if steps.len() == 3
        ));
        assert_eq!(exec.checkpoints().repo().checkpoint_count(), 0);
        assert!(exec.checkpoints().list_runs(None, 10).await.unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_required_input_is_validation_error() {
        let exec = executor(ProviderRegistry::with_builtins());
        let def = parse_workflow_yaml(
            "name: needs\ninputs:\n  topic:\n    required: true\nsteps:\n  - id: a\n    type: echo\n",
        )
        .unwrap();
        let err = exec.execute(&def, Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Validation(WorkflowError::MissingInput(_))));
        assert!(exec.checkpoints().list_runs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_lets_group_finish_then_stops() {
        let (fragile, _) = Scripted::new("fragile", |_, _| Err(ProviderError::permanent("nope")));
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(fragile);
        let exec = executor(providers);
        let def = parse_workflow_yaml(&DIAMOND.replace("    on_failure: skip\n", "")).unwrap();

        let report = exec.execute(&def, Map::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.step("C").unwrap().status, StepStatus::Succeeded);
        assert!(report.step("D").is_none());
        assert_eq!(report.last_successful_stage.as_deref(), Some("C"));

        let run = exec.checkpoints().get_run(report.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_stage.as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn test_resume_reexecutes_only_unfinished_stages() {
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        let (fragile, fragile_calls) = Scripted::new("fragile", move |_, _| {
            if flag.load(Ordering::SeqCst) {
                Ok(json!({"b": "fixed"}))
            } else {
                Err(ProviderError::permanent("down"))
            }
        });
        let (work, work_calls) = counting();
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(fragile);
        providers.register(work);
        let exec = executor(providers);
        let def = parse_workflow_yaml(
            r#"
name: pipeline
inputs:
  topic: {default: "rust"}
outputs: [summary]
steps:
  - {id: A, type: work, params: {a: "${topic}"}, outputs: [a]}
  - {id: B, type: fragile, depends_on: A, outputs: [b]}
  - {id: C, type: work, depends_on: A, params: {c: "${a}!"}, outputs: [c]}
  - {id: D, type: work, depends_on: [B, C], params: {summary: "${b} ${c}"}, outputs: [summary]}
"#,
        )
        .unwrap();

        let first = exec.execute(&def, Map::new()).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);
        assert_eq!(work_calls.load(Ordering::SeqCst), 2);

        healthy.store(true, Ordering::SeqCst);
        let resumed = exec.resume(first.run_id, &def).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.run_id, first.run_id);
        assert_eq!(resumed.outputs["summary"], json!("fixed rust!"));
        assert_eq!(fragile_calls.load(Ordering::SeqCst), 2);
        assert_eq!(work_calls.load(Ordering::SeqCst), 3, "only D re-ran on the work provider");
        let rerun: Vec<&str> = resumed.steps.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(rerun, vec!["B", "D"]);
        assert!(resumed.errors.is_empty());

        let again = exec.resume(first.run_id, &def).await.unwrap_err();
        assert!(matches!(
            again,
            ExecutorError::NotResumable { status: RunStatus::Completed, .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_resumes_admit_one() {
        use crate::test_support::Sluggish;

        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        let (fragile, calls) = Scripted::new("fragile", move |_, _| {
            if flag.load(Ordering::SeqCst) {
                Ok(json!({"b": "ok"}))
            } else {
                Err(ProviderError::permanent("down"))
            }
        });
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(fragile);
        let exec = GraphExecutor::new(
            Sluggish::new(std::time::Duration::ZERO),
            dispatcher(fast_config(), providers),
            Arc::new(ContractRegistry::new()),
            EventBus::default(),
        );
        let def = parse_workflow_yaml(
            r#"
name: once
steps:
  - {id: A, type: echo, params: {a: 1}, outputs: [a]}
  - {id: B, type: fragile, depends_on: A, outputs: [b]}
"#,
        )
        .unwrap();

        let failed = exec.execute(&def, Map::new()).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        healthy.store(true, Ordering::SeqCst);

        let (first, second) = tokio::join!(
            exec.resume(failed.run_id, &def),
            exec.resume(failed.run_id, &def)
        );
        let admitted = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        let rejected = if first.is_ok() { second } else { first };
        assert!(matches!(rejected, Err(ExecutorError::NotResumable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "one call before and one during resume");
        assert!(!exec.is_active(failed.run_id));
    }

    /// Waits until every sibling sharing the barrier is in flight.
    struct Rendezvous(Arc<tokio::sync::Barrier>);

    impl StepProvider for Rendezvous {
        fn name(&self) -> &str {
            "rendezvous"
        }

        async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
            self.0.wait().await;
            Ok(Value::Object(request.params.clone()))
        }
    }

    #[tokio::test]
    async fn test_group_siblings_run_concurrently() {
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(Rendezvous(Arc::new(tokio::sync::Barrier::new(2))));
        let exec = executor(providers);
        let def = parse_workflow_yaml(
            r#"
name: together
steps:
  - {id: left, type: rendezvous, params: {l: 1}, outputs: [l]}
  - {id: right, type: rendezvous, params: {r: 2}, outputs: [r]}
"#,
        )
        .unwrap();

        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            exec.execute(&def, Map::new()),
        )
        .await
        .expect("siblings in one group must be in flight together")
        .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.variables.get("l"), Some(&json!(1)));
        assert_eq!(report.variables.get("r"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_group_siblings_cannot_read_each_other() {
        let exec = executor(ProviderRegistry::with_builtins());
        let def = parse_workflow_yaml(
            r#"
name: isolated
steps:
  - {id: left, type: echo, params: {l: "from left"}, outputs: [l]}
  - {id: right, type: echo, params: {seen: "${l}"}, outputs: [seen]}
"#,
        )
        .unwrap();

        let report = exec.execute(&def, Map::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.step("left").unwrap().status, StepStatus::Succeeded);
        let failure = report.step("right").unwrap().failure.clone().unwrap();
        assert_eq!(failure.kind, ErrorKind::Execution);
        assert!(failure.message.contains("unresolved variable '${l}'"));
        assert!(!report.variables.contains("seen"));
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let exec = executor(ProviderRegistry::with_builtins());
        let def = parse_workflow_yaml(DIAMOND).unwrap();
        let err = exec.resume(Uuid::now_v7(), &def).await.unwrap_err();
        assert!(matches!(err, ExecutorError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_output_contract_violation_recorded_on_run() {
        let (llm, _) = Scripted::new("llm", |_, _| Ok(json!({"verdict": "maybe"})));
        let mut providers = ProviderRegistry::new();
        providers.register(llm);
        let mut contracts = ContractRegistry::new();
        contracts
            .register(Contract {
                role: "reviewer".into(),
                description: String::new(),
                input_schema: json!({"type": "object"}),
                output_schema: json!({
                    "type": "object",
                    "required": ["approved"],
                    "properties": {"approved": {"type": "boolean"}}
                }),
                required_context: Vec::new(),
            })
            .unwrap();
        let exec = executor_with(providers, contracts);
        let def = parse_workflow_yaml(
            "name: review\nsteps:\n  - id: review\n    type: llm\n    params:\n      role: reviewer\n",
        )
        .unwrap();

        let report = exec.execute(&def, Map::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.errors[0].kind, ErrorKind::ContractViolation);
        assert_eq!(report.errors[0].field.as_deref(), Some("/approved"));

        let cps = exec.checkpoints().list_checkpoints(report.run_id).await.unwrap();
        assert_eq!(cps[0].status, CheckpointStatus::Failed);
        assert_eq!(cps[0].output, Some(json!({"verdict": "maybe"})));
    }

    #[tokio::test]
    async fn test_token_budget_stops_before_next_group() {
        let (hungry, _) = Scripted::new("hungry", |_, _| Ok(json!({"response": "x", "tokens_used": 1500})));
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(hungry);
        let exec = executor(providers);
        let def = parse_workflow_yaml(
            r#"
name: budget
token_budget: 1000
steps:
  - {id: first, type: hungry}
  - {id: second, type: echo, depends_on: first}
"#,
        )
        .unwrap();

        let report = exec.execute(&def, Map::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.total_tokens, 1500);
        assert!(report.step("second").is_none());
        assert_eq!(report.errors[0].kind, ErrorKind::Execution);
        assert!(report.errors[0].message.contains("token budget"));
    }

    /// Blocks every call until the test adds permits.
    struct Gate(Arc<Semaphore>);

    impl StepProvider for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
            let permit = self
                .0
                .acquire()
                .await
                .map_err(|e| ProviderError::permanent(e.to_string()))?;
            permit.forget();
            Ok(Value::Object(request.params.clone()))
        }
    }

    const GATED: &str = r#"
name: gated
steps:
  - {id: first, type: gate, params: {v: 1}, outputs: [v]}
  - {id: second, type: echo, depends_on: first, params: {w: "${v}"}, outputs: [w]}
"#;

    async fn started_run(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Uuid {
        loop {
            if let EngineEvent::StepStarted { run_id, .. } = events.recv().await.unwrap() {
                return run_id;
            }
        }
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let gate = Arc::new(Semaphore::new(0));
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(Gate(gate.clone()));
        let exec = Arc::new(executor(providers));
        let def = parse_workflow_yaml(GATED).unwrap();
        let mut events = exec.events().subscribe();

        let running = {
            let (exec, def) = (exec.clone(), def.clone());
            tokio::spawn(async move { exec.execute(&def, Map::new()).await })
        };
        let run_id = started_run(&mut events).await;
        assert!(exec.pause(run_id));
        gate.add_permits(1);

        let paused = running.await.unwrap().unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert!(paused.step("second").is_none());
        assert!(!exec.pause(run_id));

        let resumed = exec.resume(run_id, &def).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.variables.get("w"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_cancel_active_and_idle_runs() {
        let gate = Arc::new(Semaphore::new(0));
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(Gate(gate.clone()));
        let exec = Arc::new(executor(providers));
        let def = parse_workflow_yaml(GATED).unwrap();
        let mut events = exec.events().subscribe();

        let running = {
            let (exec, def) = (exec.clone(), def.clone());
            tokio::spawn(async move { exec.execute(&def, Map::new()).await })
        };
        let run_id = started_run(&mut events).await;
        assert!(exec.cancel(run_id).await.unwrap());
        gate.add_permits(1);

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.step("first").unwrap().status, StepStatus::Succeeded);
        assert!(!exec.cancel(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_paused_run_without_executing() {
        let gate = Arc::new(Semaphore::new(0));
        let mut providers = ProviderRegistry::with_builtins();
        providers.register(Gate(gate.clone()));
        let exec = Arc::new(executor(providers));
        let def = parse_workflow_yaml(GATED).unwrap();
        let mut events = exec.events().subscribe();

        let running = {
            let (exec, def) = (exec.clone(), def.clone());
            tokio::spawn(async move { exec.execute(&def, Map::new()).await })
        };
        let run_id = started_run(&mut events).await;
        exec.pause(run_id);
        gate.add_permits(1);
        running.await.unwrap().unwrap();

        assert!(exec.cancel(run_id).await.unwrap());
        let run = exec.checkpoints().get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(matches!(
            exec.resume(run_id, &def).await,
            Err(ExecutorError::NotResumable { .. })
        ));
    }

    #[tokio::test]
    async fn test_condition_on_upstream_output() {
        let exec = executor(ProviderRegistry::with_builtins());
        let def = parse_workflow_yaml(
            r#"
name: gated-deploy
steps:
  - {id: review, type: echo, params: {verdict: reject}, outputs: [verdict]}
  - id: deploy
    type: echo
    depends_on: review
    condition: {field: verdict, operator: equals, value: approve}
    outputs: [deployed]
  - {id: notify, type: echo, depends_on: deploy, params: {msg: done}, outputs: [msg]}
"#,
        )
        .unwrap();

        let report = exec.execute(&def, Map::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.step("deploy").unwrap().status, StepStatus::Skipped);
        assert_eq!(report.step("notify").unwrap().status, StepStatus::Succeeded);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_rerunning_to_completion_is_deterministic() {
        let def = parse_workflow_yaml(DIAMOND).unwrap();
        let (p1, _) = fragile_providers();
        let (p2, _) = fragile_providers();
        let a = executor(p1).execute(&def, Map::new()).await.unwrap();
        let b = executor(p2).execute(&def, Map::new()).await.unwrap();
        assert_eq!(a.variables, b.variables);
    }
}
