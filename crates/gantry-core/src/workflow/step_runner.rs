//! Per-step execution: substitution, condition, contracts, attempts.
//!
//! `StepRunner` takes one step from a stage group to a terminal outcome. Every
//! attempt ends in exactly one checkpoint: success, failure, or (when the
//! attempt is torn down before it settles) an abandoned `running` record
//! written from the attempt guard's destructor.

use std::sync::Arc;
use std::time::Instant;

use gantry_types::event::EngineEvent;
use gantry_types::workflow::{
    ErrorKind, OnFailure, ResourceUsage, StepDefinition, StepFailure,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Instrument;
use uuid::Uuid;

use super::checkpoint::{AttemptRecord, CheckpointError, CheckpointManager};
use super::composite::{self, Composite};
use super::condition;
use super::variables::{TemplateError, Variables};
use crate::contract::{ContractRegistry, ContractViolation};
use crate::event::EventBus;
use crate::provider::{ProviderRequest, tokens_used};
use crate::repository::checkpoint::CheckpointRepository;
use crate::resilience::{ResilientDispatcher, RetryPolicy};

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Terminal outcome of one step in one run.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub stage: String,
    pub status: StepStatus,
    /// Provider result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    pub attempts: u32,
    /// Provider that served the successful attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub duration_ms: u64,
    pub tokens_used: u64,
}

impl StepResult {
    fn skipped(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: StepStatus::Skipped,
            output: None,
            failure: None,
            attempts: 0,
            provider: None,
            duration_ms: 0,
            tokens_used: 0,
        }
    }

    pub(crate) fn failed(
        stage: &str,
        failure: StepFailure,
        attempts: u32,
        duration_ms: u64,
        tokens_used: u64,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            status: StepStatus::Failed,
            output: None,
            failure: Some(failure),
            attempts,
            provider: None,
            duration_ms,
            tokens_used,
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt guard
// ---------------------------------------------------------------------------

/// Writes an abandoned checkpoint if dropped before `settle`.
struct AttemptGuard<R: CheckpointRepository + 'static> {
    checkpoints: Arc<CheckpointManager<R>>,
    record: Option<AttemptRecord>,
    started: Instant,
}

impl<R: CheckpointRepository + 'static> AttemptGuard<R> {
    fn new(checkpoints: Arc<CheckpointManager<R>>, record: AttemptRecord) -> Self {
        Self {
            checkpoints,
            record: Some(record),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        elapsed_ms(self.started)
    }

    /// Write the attempt's terminal checkpoint and disarm the guard.
    ///
    /// The write runs on its own task, so it completes even when the attempt
    /// future is dropped while awaiting it.
    async fn settle(&mut self, outcome: AttemptOutcome) -> Result<(), CheckpointError> {
        let Some(record) = self.record.take() else {
            return Ok(());
        };
        let checkpoints = self.checkpoints.clone();
        let write = tokio::spawn(async move {
            match outcome {
                AttemptOutcome::Success { output, metrics } => {
                    checkpoints.record_success(&record, output, metrics).await
                }
                AttemptOutcome::Failure {
                    failure,
                    output,
                    metrics,
                } => {
                    checkpoints
                        .record_failure(&record, failure, output, metrics)
                        .await
                }
            }
        });
        match write.await {
            Ok(written) => written,
            Err(e) => Err(CheckpointError::Repository(format!(
                "checkpoint write task failed: {e}"
            ))),
        }
    }
}

enum AttemptOutcome {
    Success {
        output: Value,
        metrics: ResourceUsage,
    },
    Failure {
        failure: StepFailure,
        output: Option<Value>,
        metrics: ResourceUsage,
    },
}

impl<R: CheckpointRepository + 'static> Drop for AttemptGuard<R> {
    fn drop(&mut self) {
        let Some(record) = self.record.take() else {
            return;
        };
        let metrics = ResourceUsage {
            duration_ms: self.elapsed_ms(),
            ..ResourceUsage::default()
        };
        tracing::warn!(
            run_id = %record.run_id,
            step_id = %record.stage,
            attempt = record.attempt,
            "attempt abandoned before completion"
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let checkpoints = self.checkpoints.clone();
        handle.spawn(async move {
            if let Err(e) = checkpoints.record_abandoned(&record, metrics).await {
                tracing::error!(
                    run_id = %record.run_id,
                    step_id = %record.stage,
                    error = %e,
                    "failed to record abandoned attempt"
                );
            }
        });
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub struct StepRunner<R: CheckpointRepository + 'static> {
    dispatcher: ResilientDispatcher,
    contracts: Arc<ContractRegistry>,
    checkpoints: Arc<CheckpointManager<R>>,
    events: EventBus,
    retry: RetryPolicy,
}

impl<R: CheckpointRepository + 'static> StepRunner<R> {
    pub fn new(
        dispatcher: ResilientDispatcher,
        contracts: Arc<ContractRegistry>,
        checkpoints: Arc<CheckpointManager<R>>,
        events: EventBus,
    ) -> Self {
        let retry = dispatcher.resilience().retry_policy().clone();
        Self {
            dispatcher,
            contracts,
            checkpoints,
            events,
            retry,
        }
    }

    /// Drive `step` to a terminal outcome against a snapshot of the run's
    /// variables. Only checkpoint write failures are returned as errors.
    ///
    /// Transient failures are retried only when the step says
    /// `on_failure: retry`; `abort` and `skip` steps get a single attempt.
    pub async fn run(
        &self,
        run_id: Uuid,
        step: &StepDefinition,
        variables: &Variables,
    ) -> Result<StepResult, CheckpointError> {
        let mut record = AttemptRecord {
            run_id,
            stage: step.id.clone(),
            attempt: 1,
            input: Value::Object(step.params.clone()),
        };

        let params = match substitute_step_params(step, variables) {
            Ok(params) => params,
            Err(e) => {
                let failure = StepFailure::new(&step.id, ErrorKind::Execution, e.to_string());
                return self.fail_before_dispatch(&record, failure).await;
            }
        };
        record.input = Value::Object(params.clone());

        if let Some(guard) = &step.condition {
            if !condition::evaluate(guard, variables) {
                self.checkpoints.record_skipped(&record).await?;
                tracing::debug!(run_id = %run_id, step_id = %step.id, "condition false, step skipped");
                self.events.publish(EngineEvent::StepSkipped {
                    run_id,
                    stage: step.id.clone(),
                });
                return Ok(StepResult::skipped(&step.id));
            }
        }

        let role = step.role();
        if let Some(role) = role {
            let payload = contract_input(&params);
            if let Err(violation) = self.contracts.validate_input(role, &payload, variables) {
                let failure = violation_failure(&step.id, &violation, Vec::new());
                return self.fail_before_dispatch(&record, failure).await;
            }
        }

        // Only `on_failure: retry` re-attempts, up to `max_retries` more times
        // and only after transient failures. `abort` and `skip` get one attempt
        // whatever `max_retries` says.
        let max_attempts = match step.on_failure {
            OnFailure::Retry => step.max_retries.saturating_add(1),
            OnFailure::Abort | OnFailure::Skip => 1,
        };
        let started = Instant::now();
        let mut tokens_total = 0;
        let mut attempt = 0;

        // Each pass is one attempt and ends in exactly one checkpoint.
        loop {
            attempt += 1;
            record.attempt = attempt;
            self.events.publish(EngineEvent::StepStarted {
                run_id,
                stage: step.id.clone(),
                attempt,
            });
            let mut guard = AttemptGuard::new(self.checkpoints.clone(), record.clone());
            let request = ProviderRequest {
                run_id,
                stage: step.id.clone(),
                action: step.step_type.clone(),
                params: params.clone(),
            };

            let span = tracing::debug_span!("step_attempt", run_id = %run_id, step_id = %step.id, attempt);
            let dispatched = if composite::is_composite(&step.step_type) {
                Composite::new(&self.dispatcher, variables, step.timeout())
                    .dispatch(&request)
                    .instrument(span)
                    .await
            } else {
                self.dispatcher
                    .dispatch(&request, step.timeout())
                    .instrument(span)
                    .await
            };

            match dispatched {
                Ok(dispatched) => {
                    let tokens = tokens_used(&dispatched.output);
                    tokens_total += tokens;
                    let metrics = ResourceUsage {
                        duration_ms: dispatched.duration.as_millis() as u64,
                        tokens_used: tokens,
                        provider: Some(dispatched.provider.clone()),
                    };

                    if let Some(role) = role {
                        if let Err(violation) = self.contracts.validate_output(role, &dispatched.output) {
                            let failure =
                                violation_failure(&step.id, &violation, dispatched.providers_attempted);
                            guard
                                .settle(AttemptOutcome::Failure {
                                    failure: failure.clone(),
                                    output: Some(dispatched.output),
                                    metrics,
                                })
                                .await?;
                            self.publish_failure(run_id, &step.id, attempt, &failure, false);
                            return Ok(StepResult::failed(
                                &step.id,
                                failure,
                                attempt,
                                elapsed_ms(started),
                                tokens_total,
                            ));
                        }
                    }

                    guard
                        .settle(AttemptOutcome::Success {
                            output: dispatched.output.clone(),
                            metrics,
                        })
                        .await?;

                    tracing::debug!(
                        run_id = %run_id,
                        step_id = %step.id,
                        attempt,
                        provider = %dispatched.provider,
                        "step succeeded"
                    );
                    self.events.publish(EngineEvent::StepCompleted {
                        run_id,
                        stage: step.id.clone(),
                        attempt,
                        provider: dispatched.provider.clone(),
                        duration_ms: dispatched.duration.as_millis() as u64,
                    });
                    return Ok(StepResult {
                        stage: step.id.clone(),
                        status: StepStatus::Succeeded,
                        output: Some(dispatched.output),
                        failure: None,
                        attempts: attempt,
                        provider: Some(dispatched.provider),
                        duration_ms: elapsed_ms(started),
                        tokens_used: tokens_total,
                    });
                }
                Err(dispatch) => {
                    let mut failure =
                        StepFailure::new(&step.id, dispatch.error.kind(), dispatch.error.to_string());
                    failure.providers_attempted = dispatch.providers_attempted;
                    let will_retry = dispatch.error.is_transient() && attempt < max_attempts;

                    let metrics = ResourceUsage {
                        duration_ms: guard.elapsed_ms(),
                        ..ResourceUsage::default()
                    };
                    guard
                        .settle(AttemptOutcome::Failure {
                            failure: failure.clone(),
                            output: None,
                            metrics,
                        })
                        .await?;
                    self.publish_failure(run_id, &step.id, attempt, &failure, will_retry);

                    if !will_retry {
                        return Ok(StepResult::failed(
                            &step.id,
                            failure,
                            attempt,
                            elapsed_ms(started),
                            tokens_total,
                        ));
                    }

                    let delay = self
                        .retry
                        .delay_with_hint(attempt - 1, dispatch.error.retry_after());
                    tracing::debug!(
                        run_id = %run_id,
                        step_id = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fail_before_dispatch(
        &self,
        record: &AttemptRecord,
        failure: StepFailure,
    ) -> Result<StepResult, CheckpointError> {
        self.checkpoints
            .record_failure(record, failure.clone(), None, ResourceUsage::default())
            .await?;
        self.publish_failure(record.run_id, &record.stage, record.attempt, &failure, false);
        Ok(StepResult::failed(&record.stage, failure, 1, 0, 0))
    }

    fn publish_failure(
        &self,
        run_id: Uuid,
        stage: &str,
        attempt: u32,
        failure: &StepFailure,
        will_retry: bool,
    ) {
        tracing::warn!(
            run_id = %run_id,
            step_id = stage,
            attempt,
            kind = %failure.kind,
            will_retry,
            error = %failure.message,
            "step attempt failed"
        );
        self.events.publish(EngineEvent::StepFailed {
            run_id,
            stage: stage.to_string(),
            attempt,
            kind: failure.kind,
            message: failure.message.clone(),
            will_retry,
        });
    }
}

/// Substitute a step's parameters. Nested templates of composite steps are
/// left for the composite to fill in per sub-call.
fn substitute_step_params(
    step: &StepDefinition,
    variables: &Variables,
) -> Result<Map<String, Value>, TemplateError> {
    if !composite::is_composite(&step.step_type) {
        return variables.substitute_params(&step.params);
    }
    step.params
        .iter()
        .map(|(key, value)| {
            let value = if composite::TEMPLATE_KEYS.contains(&key.as_str()) {
                value.clone()
            } else {
                variables.substitute(value)?
            };
            Ok((key.clone(), value))
        })
        .collect()
}

/// The payload checked against a role's input schema: `params.input`, or an
/// empty object when absent.
fn contract_input(params: &Map<String, Value>) -> Value {
    params
        .get("input")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn violation_failure(stage: &str, violation: &ContractViolation, providers: Vec<String>) -> StepFailure {
    StepFailure {
        stage: stage.to_string(),
        kind: ErrorKind::ContractViolation,
        message: violation.to_string(),
        field: Some(violation.field.clone()),
        providers_attempted: providers,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderRegistry;
    use crate::repository::memory::InMemoryCheckpointRepository;
    use crate::test_support::{Scripted, dispatcher, fast_config};
    use gantry_types::contract::Contract;
    use gantry_types::error::ProviderError;
    use gantry_types::workflow::{CheckpointStatus, WorkflowRun};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Fixture {
        runner: StepRunner<InMemoryCheckpointRepository>,
        checkpoints: Arc<CheckpointManager<InMemoryCheckpointRepository>>,
        run_id: Uuid,
    }

    async fn fixture(providers: ProviderRegistry, contracts: ContractRegistry) -> Fixture {
        let checkpoints = Arc::new(CheckpointManager::new(InMemoryCheckpointRepository::new()));
        let run = WorkflowRun::new("wf", Map::new());
        checkpoints.create_run(&run).await.unwrap();
        let runner = StepRunner::new(
            dispatcher(fast_config(), providers),
            Arc::new(contracts),
            checkpoints.clone(),
            EventBus::default(),
        );
        Fixture {
            runner,
            checkpoints,
            run_id: run.id,
        }
    }

    fn step(yaml: &str) -> StepDefinition {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn summarizer_contract() -> ContractRegistry {
        let mut contracts = ContractRegistry::new();
        contracts
            .register(Contract {
                role: "summarizer".into(),
                description: String::new(),
                input_schema: json!({"type": "object", "required": ["text"]}),
                output_schema: json!({"type": "object", "required": ["summary"]}),
                required_context: Vec::new(),
            })
            .unwrap();
        contracts
    }

    #[tokio::test]
    async fn test_unresolved_variable_is_execution_error() {
        let f = fixture(ProviderRegistry::with_builtins(), ContractRegistry::new()).await;
        let s = step("id: greet\ntype: echo\nparams:\n  text: \"hi ${who}\"\n");

        let result = f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::Execution);
        assert!(failure.message.contains("who"));

        let cps = f.checkpoints.list_checkpoints(f.run_id).await.unwrap();
        assert_eq!(cps.len(), 1);
        assert_eq!(cps[0].status, CheckpointStatus::Failed);
    }

    #[tokio::test]
    async fn test_false_condition_skips_with_marker() {
        let (provider, calls) = Scripted::new("work", |_, _| Ok(json!({})));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, ContractRegistry::new()).await;
        let s = step(
            "id: deploy\ntype: work\ncondition:\n  field: verdict\n  operator: equals\n  value: pass\n",
        );
        let mut vars = Variables::new();
        vars.insert("verdict", json!("fail"));

        let result = f.runner.run(f.run_id, &s, &vars).await.unwrap();
        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let cps = f.checkpoints.list_checkpoints(f.run_id).await.unwrap();
        assert_eq!(cps[0].status, CheckpointStatus::Success);
        assert!(cps[0].skipped);
    }

    #[tokio::test]
    async fn test_input_contract_violation_skips_call() {
        let (provider, calls) = Scripted::new("llm", |_, _| Ok(json!({"summary": "ok"})));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, summarizer_contract()).await;
        let s = step("id: sum\ntype: llm\non_failure: retry\nparams:\n  role: summarizer\n  input:\n    body: x\n");

        let result = f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::ContractViolation);
        assert_eq!(failure.field.as_deref(), Some("/text"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.checkpoints.repo().checkpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_output_contract_violation_keeps_raw_output() {
        let (provider, calls) = Scripted::new("llm", |_, _| Ok(json!({"text": "no summary"})));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, summarizer_contract()).await;
        let s = step(
            "id: sum\ntype: llm\non_failure: retry\nparams:\n  role: summarizer\n  input:\n    text: long\n",
        );

        let result = f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::ContractViolation);
        assert_eq!(failure.field.as_deref(), Some("/summary"));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "contract violations are never retried");

        let cps = f.checkpoints.list_checkpoints(f.run_id).await.unwrap();
        assert_eq!(cps.len(), 1);
        assert_eq!(cps[0].output, Some(json!({"text": "no summary"})));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_succeeds() {
        let (provider, calls) = Scripted::new("flaky", |_, n| {
            if n < 2 {
                Err(ProviderError::transient("503"))
            } else {
                Ok(json!({"response": "done", "tokens_used": 12}))
            }
        });
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, ContractRegistry::new()).await;
        let s = step("id: call\ntype: flaky\non_failure: retry\nmax_retries: 3\n");

        let result = f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.tokens_used, 12);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let cps = f.checkpoints.list_checkpoints(f.run_id).await.unwrap();
        let attempts: Vec<(u32, CheckpointStatus)> = cps.iter().map(|c| (c.attempt, c.status)).collect();
        assert_eq!(
            attempts,
            vec![
                (3, CheckpointStatus::Success),
                (2, CheckpointStatus::Failed),
                (1, CheckpointStatus::Failed)
            ]
        );
        assert_eq!(cps[0].metrics.provider.as_deref(), Some("flaky"));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let (provider, calls) = Scripted::new("auth", |_, _| Err(ProviderError::permanent("403")));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, ContractRegistry::new()).await;
        let s = step("id: call\ntype: auth\non_failure: retry\nmax_retries: 3\n");

        let result = f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        assert_eq!(result.failure.unwrap().kind, ErrorKind::PermanentProvider);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (provider, calls) = Scripted::new("down", |_, _| Err(ProviderError::transient("503")));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, ContractRegistry::new()).await;
        let s = step("id: call\ntype: down\non_failure: retry\nmax_retries: 2\n");

        let result = f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        assert_eq!(result.attempts, 3);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::TransientProvider);
        assert_eq!(failure.providers_attempted, vec!["down"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_abort_policy_makes_single_attempt() {
        let (provider, calls) = Scripted::new("down", |_, _| Err(ProviderError::transient("503")));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, ContractRegistry::new()).await;
        let s = step("id: call\ntype: down\nmax_retries: 5\n");

        f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_policy_makes_single_attempt() {
        let (provider, calls) = Scripted::new("down", |_, _| Err(ProviderError::transient("503")));
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let f = fixture(providers, ContractRegistry::new()).await;
        let s = step("id: call\ntype: down\non_failure: skip\nmax_retries: 5\n");

        let result = f.runner.run(f.run_id, &s, &Variables::new()).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_dropped_during_write_keeps_one_checkpoint() {
        use crate::test_support::Sluggish;

        let checkpoints = Arc::new(CheckpointManager::new(Sluggish::new(
            std::time::Duration::from_millis(50),
        )));
        let run = WorkflowRun::new("wf", Map::new());
        checkpoints.create_run(&run).await.unwrap();
        let runner = StepRunner::new(
            dispatcher(fast_config(), ProviderRegistry::with_builtins()),
            Arc::new(ContractRegistry::new()),
            checkpoints.clone(),
            EventBus::default(),
        );
        let s = step("id: say\ntype: echo\nparams:\n  v: 1\n");
        let vars = Variables::new();

        let attempt = runner.run(run.id, &s, &vars);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), attempt).await;
        assert!(timed_out.is_err(), "the write outlives the attempt");

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let cps = checkpoints.list_checkpoints(run.id).await.unwrap();
        assert_eq!(cps.len(), 1);
        assert_eq!(cps[0].status, CheckpointStatus::Success);
        assert_eq!(cps[0].output, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_dropped_attempt_records_abandoned_checkpoint() {
        struct Hangs;
        impl crate::provider::StepProvider for Hangs {
            fn name(&self) -> &str {
                "hangs"
            }
            async fn invoke(&self, _request: &ProviderRequest) -> Result<Value, ProviderError> {
                std::future::pending().await
            }
        }

        let mut providers = ProviderRegistry::new();
        providers.register(Hangs);
        let f = fixture(providers, ContractRegistry::new()).await;
        let s = step("id: wait\ntype: hangs\n");

        let vars = Variables::new();
        let attempt = f.runner.run(f.run_id, &s, &vars);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), attempt).await;
        assert!(timed_out.is_err());

        for _ in 0..100 {
            if f.checkpoints.repo().checkpoint_count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let cps = f.checkpoints.list_checkpoints(f.run_id).await.unwrap();
        assert_eq!(cps.len(), 1);
        assert_eq!(cps[0].status, CheckpointStatus::Running);
    }
}
