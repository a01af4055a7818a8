//! Composite step kinds that orchestrate other providers within one step.
//!
//! - `fan_out` runs a step template once per item, with a concurrency cap.
//! - `map_reduce` fans out a map template, then feeds the collected results to
//!   a reduce template.
//! - `parallel` runs a list of sub-steps, honouring their `depends_on`.
//!
//! Every sub-call goes through the [`ResilientDispatcher`], so bulkheads,
//! breakers, limiters and fallbacks apply per sub-provider. Composite kinds
//! cannot nest. Sub-calls make one attempt each; the enclosing step's
//! `on_failure` policy governs the composite as a whole.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream;
use gantry_types::error::ProviderError;
use gantry_types::workflow::StepDefinition;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::dag::build_execution_plan;
use super::variables::Variables;
use crate::provider::{ProviderRequest, tokens_used};
use crate::resilience::{DispatchError, DispatchFailure, Dispatched, ResilientDispatcher};

pub const FAN_OUT: &str = "fan_out";
pub const MAP_REDUCE: &str = "map_reduce";
pub const PARALLEL: &str = "parallel";

/// Parameters holding nested step templates. They are substituted per
/// sub-call, not when the enclosing step starts.
pub const TEMPLATE_KEYS: [&str; 4] = ["step_template", "map_step", "reduce_step", "steps"];

const DEFAULT_MAX_CONCURRENT: usize = 5;
const DEFAULT_MAX_WORKERS: usize = 4;

pub fn is_composite(kind: &str) -> bool {
    matches!(kind, FAN_OUT | MAP_REDUCE | PARALLEL)
}

/// A nested step: provider kind plus parameters with placeholders intact.
#[derive(Debug, Clone, Deserialize)]
struct StepTemplate {
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    params: Map<String, Value>,
}

/// One finished sub-call.
struct SubOutcome {
    index: usize,
    result: Result<Dispatched, DispatchFailure>,
}

fn invalid(kind: &str, message: impl Into<String>) -> DispatchFailure {
    DispatchFailure {
        error: DispatchError::Provider {
            provider: kind.to_string(),
            source: ProviderError::permanent(message),
        },
        providers_attempted: Vec::new(),
    }
}

/// Providers reached by the sub-calls, in first-seen order.
fn attempted<'a>(results: impl Iterator<Item = &'a Result<Dispatched, DispatchFailure>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut providers = Vec::new();
    for result in results {
        let names = match result {
            Ok(dispatched) => &dispatched.providers_attempted,
            Err(failure) => &failure.providers_attempted,
        };
        for name in names {
            if seen.insert(name.clone()) {
                providers.push(name.clone());
            }
        }
    }
    providers
}

/// The value a sub-result contributes to a result list: its `response`
/// field when present, else the whole output.
fn primary_value(output: &Value) -> Value {
    output.get("response").cloned().unwrap_or_else(|| output.clone())
}

/// Runs composite steps against a dispatcher.
pub struct Composite<'a> {
    dispatcher: &'a ResilientDispatcher,
    variables: &'a Variables,
    timeout: Duration,
}

impl<'a> Composite<'a> {
    /// `variables` is the run snapshot the enclosing step sees; `timeout`
    /// bounds each sub-call.
    pub fn new(dispatcher: &'a ResilientDispatcher, variables: &'a Variables, timeout: Duration) -> Self {
        Self {
            dispatcher,
            variables,
            timeout,
        }
    }

    /// Run `request`, whose action must be a composite kind.
    pub async fn dispatch(&self, request: &ProviderRequest) -> Result<Dispatched, DispatchFailure> {
        let started = Instant::now();
        let (output, providers_attempted) = match request.action.as_str() {
            FAN_OUT => self.fan_out(request).await?,
            MAP_REDUCE => self.map_reduce(request).await?,
            PARALLEL => self.parallel(request).await?,
            other => return Err(invalid(other, format!("'{other}' is not a composite step kind"))),
        };
        Ok(Dispatched {
            output,
            provider: request.action.clone(),
            providers_attempted,
            duration: started.elapsed(),
        })
    }

    // -----------------------------------------------------------------------
    // Sub-calls
    // -----------------------------------------------------------------------

    fn template(&self, kind: &str, request: &ProviderRequest, key: &str) -> Result<StepTemplate, DispatchFailure> {
        let raw = request
            .params
            .get(key)
            .ok_or_else(|| invalid(kind, format!("{kind} requires '{key}'")))?;
        let template: StepTemplate = serde_json::from_value(raw.clone())
            .map_err(|e| invalid(kind, format!("invalid '{key}': {e}")))?;
        if is_composite(&template.step_type) {
            return Err(invalid(kind, format!("'{key}' cannot use composite kind '{}'", template.step_type)));
        }
        Ok(template)
    }

    async fn call(
        &self,
        parent: &ProviderRequest,
        sub_id: &str,
        template: &StepTemplate,
        variables: &Variables,
    ) -> Result<Dispatched, DispatchFailure> {
        let params = variables.substitute_params(&template.params).map_err(|e| DispatchFailure {
            error: DispatchError::Provider {
                provider: template.step_type.clone(),
                source: ProviderError::permanent(e.to_string()),
            },
            providers_attempted: Vec::new(),
        })?;
        let request = ProviderRequest {
            run_id: parent.run_id,
            stage: format!("{}.{sub_id}", parent.stage),
            action: template.step_type.clone(),
            params,
        };
        self.dispatcher.dispatch(&request, self.timeout).await
    }

    /// Run `template` once per item, at most `max_concurrent` at a time.
    /// Each call sees `${item}` and `${index}`. Outcomes are in item order.
    async fn scatter(
        &self,
        parent: &ProviderRequest,
        template: &StepTemplate,
        items: &[Value],
        max_concurrent: usize,
        fail_fast: bool,
    ) -> Result<Vec<SubOutcome>, DispatchFailure> {
        let mut calls = stream::iter(items.iter().enumerate())
            .map(|(index, item)| async move {
                let mut variables = self.variables.clone();
                variables.insert("item", item.clone());
                variables.insert("index", json!(index));
                let result = self
                    .call(parent, &format!("item_{index}"), template, &variables)
                    .await;
                SubOutcome { index, result }
            })
            .buffer_unordered(max_concurrent.max(1))
            .boxed();

        let mut outcomes: Vec<SubOutcome> = Vec::with_capacity(items.len());
        while let Some(outcome) = calls.next().await {
            if fail_fast {
                if let Err(failure) = &outcome.result {
                    tracing::warn!(
                        stage = %parent.stage,
                        index = outcome.index,
                        error = %failure,
                        "fan-out item failed, cancelling the rest"
                    );
                    let mut failure = failure.clone();
                    failure.providers_attempted =
                        attempted(outcomes.iter().map(|o| &o.result).chain([&outcome.result]));
                    return Err(failure);
                }
            }
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);
        Ok(outcomes)
    }

    fn items(&self, kind: &str, request: &ProviderRequest) -> Result<Vec<Value>, DispatchFailure> {
        match request.params.get("items") {
            Some(Value::Array(items)) => Ok(items.clone()),
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(other) => Err(invalid(kind, format!("{kind} items must be a list, got {other}"))),
        }
    }

    // -----------------------------------------------------------------------
    // fan_out
    // -----------------------------------------------------------------------

    /// Params: `items` (list), `step_template` (`{type, params}`),
    /// `max_concurrent` (default 5), `fail_fast` (default false),
    /// `collect_errors` (default true).
    async fn fan_out(&self, request: &ProviderRequest) -> Result<(Value, Vec<String>), DispatchFailure> {
        let items = self.items(FAN_OUT, request)?;
        let template = self.template(FAN_OUT, request, "step_template")?;
        let max_concurrent = param_usize(request, "max_concurrent", DEFAULT_MAX_CONCURRENT);
        let fail_fast = param_bool(request, "fail_fast", false);
        let collect_errors = param_bool(request, "collect_errors", true);

        let outcomes = self
            .scatter(request, &template, &items, max_concurrent, fail_fast)
            .await?;
        let providers = attempted(outcomes.iter().map(|o| &o.result));
        let summary = Gathered::new(&items, &outcomes);
        tracing::debug!(
            stage = %request.stage,
            successful = summary.successful,
            failed = summary.failed,
            "fan-out finished"
        );

        let output = json!({
            "results": summary.results,
            "detailed_results": summary.detailed,
            "errors": if collect_errors { summary.errors } else { Vec::new() },
            "successful": summary.successful,
            "failed": summary.failed,
            "tokens_used": summary.tokens,
        });
        Ok((output, providers))
    }

    // -----------------------------------------------------------------------
    // map_reduce
    // -----------------------------------------------------------------------

    /// Params: `items`, `map_step`, `reduce_step`, `max_concurrent`,
    /// `fail_fast`. The reduce call sees the successful map results as
    /// `${map_results}`.
    async fn map_reduce(&self, request: &ProviderRequest) -> Result<(Value, Vec<String>), DispatchFailure> {
        let items = self.items(MAP_REDUCE, request)?;
        let map_step = self.template(MAP_REDUCE, request, "map_step")?;
        let reduce_step = self.template(MAP_REDUCE, request, "reduce_step")?;
        let max_concurrent = param_usize(request, "max_concurrent", DEFAULT_MAX_CONCURRENT);
        let fail_fast = param_bool(request, "fail_fast", false);

        let outcomes = self
            .scatter(request, &map_step, &items, max_concurrent, fail_fast)
            .await?;
        let map = Gathered::new(&items, &outcomes);

        let mut variables = self.variables.clone();
        variables.insert("map_results", Value::Array(map.results.clone()));
        let reduced = self.call(request, "reduce", &reduce_step, &variables).await;
        let providers = attempted(outcomes.iter().map(|o| &o.result).chain([&reduced]));
        let reduced = reduced.map_err(|mut failure| {
            failure.providers_attempted = providers.clone();
            failure
        })?;

        let output = json!({
            "response": primary_value(&reduced.output),
            "reduce": reduced.output,
            "map_results": map.results,
            "map_errors": map.errors,
            "map_successful": map.successful,
            "map_failed": map.failed,
            "tokens_used": map.tokens + tokens_used(&reduced.output),
        });
        Ok((output, providers))
    }

    // -----------------------------------------------------------------------
    // parallel
    // -----------------------------------------------------------------------

    /// Params: `steps` (sub-step definitions with `id`, `type`, `params`,
    /// optional `depends_on` and `outputs`), `max_workers` (default 4),
    /// `fail_fast` (default false).
    ///
    /// Sub-steps run in dependency layers. A sub-step sees the outputs its
    /// earlier layers published; one whose dependency failed is not called.
    /// Published outputs are also copied to the top level of the result so
    /// the enclosing step can declare them.
    async fn parallel(&self, request: &ProviderRequest) -> Result<(Value, Vec<String>), DispatchFailure> {
        let steps: Vec<StepDefinition> = match request.params.get("steps") {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| invalid(PARALLEL, format!("invalid 'steps': {e}")))?,
        };
        if let Some(nested) = steps.iter().find(|s| is_composite(&s.step_type)) {
            return Err(invalid(
                PARALLEL,
                format!("sub-step '{}' cannot use composite kind '{}'", nested.id, nested.step_type),
            ));
        }
        let plan = build_execution_plan(&steps).map_err(|e| invalid(PARALLEL, e.to_string()))?;
        let max_workers = param_usize(request, "max_workers", DEFAULT_MAX_WORKERS);
        let fail_fast = param_bool(request, "fail_fast", false);

        let mut variables = self.variables.clone();
        let mut results = Map::new();
        let mut published = Map::new();
        let mut failed: HashSet<&str> = HashSet::new();
        let mut finished = Vec::new();
        let mut tokens = 0;

        for group in &plan.groups {
            let mut runnable = Vec::new();
            for id in group {
                let Some(step) = steps.iter().find(|s| &s.id == id) else {
                    continue;
                };
                if let Some(dep) = step.depends_on.iter().find(|d| failed.contains(d.as_str())) {
                    results.insert(id.clone(), json!({"error": format!("dependency '{dep}' failed")}));
                    failed.insert(step.id.as_str());
                    continue;
                }
                runnable.push(step);
            }

            let snapshot = &variables;
            let mut calls = stream::iter(runnable)
                .map(|step| async move {
                    let template = StepTemplate {
                        step_type: step.step_type.clone(),
                        params: step.params.clone(),
                    };
                    (step, self.call(request, &step.id, &template, snapshot).await)
                })
                .buffer_unordered(max_workers.max(1))
                .boxed();

            let mut layer = Vec::new();
            while let Some((step, result)) = calls.next().await {
                if fail_fast {
                    if let Err(failure) = &result {
                        let mut failure = failure.clone();
                        failure.providers_attempted = attempted(finished.iter().chain([&result]));
                        return Err(failure);
                    }
                }
                layer.push((step, result));
            }
            drop(calls);

            layer.sort_by(|a, b| a.0.id.cmp(&b.0.id));
            for (step, result) in layer {
                match &result {
                    Ok(dispatched) => {
                        tokens += tokens_used(&dispatched.output);
                        for name in variables.merge_step_outputs(step, &dispatched.output) {
                            if let Some(value) = variables.get(&name) {
                                published.insert(name, value.clone());
                            }
                        }
                        results.insert(step.id.clone(), dispatched.output.clone());
                    }
                    Err(failure) => {
                        tracing::warn!(
                            stage = %request.stage,
                            sub_step = %step.id,
                            error = %failure,
                            "parallel sub-step failed"
                        );
                        results.insert(step.id.clone(), json!({"error": failure.to_string()}));
                        failed.insert(step.id.as_str());
                    }
                }
                finished.push(result);
            }
        }

        let providers = attempted(finished.iter());
        let mut output = Map::new();
        for (name, value) in &published {
            output.insert(name.clone(), value.clone());
        }
        output.insert("successful".into(), json!(results.len() - failed.len()));
        output.insert("failed".into(), json!(failed.len()));
        output.insert("tokens_used".into(), json!(tokens));
        output.insert("outputs".into(), Value::Object(published));
        output.insert("parallel_results".into(), Value::Object(results));
        Ok((Value::Object(output), providers))
    }
}

/// Fan-out outcomes summarised in item order.
struct Gathered {
    results: Vec<Value>,
    detailed: Vec<Value>,
    errors: Vec<Value>,
    successful: usize,
    failed: usize,
    tokens: u64,
}

impl Gathered {
    fn new(items: &[Value], outcomes: &[SubOutcome]) -> Self {
        let mut gathered = Self {
            results: Vec::new(),
            detailed: Vec::new(),
            errors: Vec::new(),
            successful: 0,
            failed: 0,
            tokens: 0,
        };
        for outcome in outcomes {
            let item = items.get(outcome.index).cloned().unwrap_or(Value::Null);
            match &outcome.result {
                Ok(dispatched) => {
                    gathered.successful += 1;
                    gathered.tokens += tokens_used(&dispatched.output);
                    gathered.results.push(primary_value(&dispatched.output));
                    gathered.detailed.push(json!({
                        "item": item,
                        "index": outcome.index,
                        "output": dispatched.output,
                    }));
                }
                Err(failure) => {
                    gathered.failed += 1;
                    gathered.errors.push(json!({
                        "item": item,
                        "index": outcome.index,
                        "kind": failure.error.kind(),
                        "error": failure.to_string(),
                    }));
                }
            }
        }
        gathered
    }
}

fn param_usize(request: &ProviderRequest, key: &str, default: usize) -> usize {
    request
        .params
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(default)
}

fn param_bool(request: &ProviderRequest, key: &str, default: bool) -> bool {
    request.params.get(key).and_then(Value::as_bool).unwrap_or(default)
}
