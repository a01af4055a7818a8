//! Workflow commands: validate, plan, run, resume, cancel.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;

use gantry_core::resilience::CircuitState;
use gantry_core::workflow::composite;
use gantry_core::workflow::dag::build_execution_plan;
use gantry_core::workflow::definition::{discover_workflows, load_workflow_file};
use gantry_core::workflow::executor::{ExecutorError, RunReport, WorkflowExecutor};
use gantry_core::workflow::step_runner::StepStatus;
use gantry_types::event::EngineEvent;
use gantry_types::workflow::{RunStatus, WorkflowDefinition};

use super::{parse_run_id, status_cell};
use crate::state::{AppState, provider_registry};

/// Output switches shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn styled(&self) -> bool {
        !self.json && !self.quiet
    }
}

fn load(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).with_context(|| format!("failed to load workflow {}", file.display()))
}

// ---------------------------------------------------------------------------
// Validate / Plan
// ---------------------------------------------------------------------------

pub fn validate(path: &Path, out: Output) -> Result<()> {
    let defs = if path.is_dir() {
        let found: Vec<WorkflowDefinition> =
            discover_workflows(path)?.into_iter().map(|(_, def)| def).collect();
        if found.is_empty() {
            bail!("no workflow definitions found under {}", path.display());
        }
        found
    } else {
        vec![load(path)?]
    };

    let providers = provider_registry();
    let mut reports = Vec::with_capacity(defs.len());
    for def in &defs {
        let plan = build_execution_plan(&def.steps)?;
        let mut warnings = plan.warnings();
        for step in &def.steps {
            if !providers.contains(&step.step_type) && !composite::is_composite(&step.step_type) {
                warnings.push(format!(
                    "step '{}' uses type '{}', which has no registered provider",
                    step.id, step.step_type
                ));
            }
        }

        if out.styled() {
            println!();
            println!(
                "  {} Workflow '{}' is valid ({} steps, {} stage groups)",
                style("✓").green().bold(),
                style(&def.name).cyan(),
                def.steps.len(),
                plan.groups.len()
            );
            print_warnings(&warnings);
        }
        reports.push(json!({
            "valid": true,
            "workflow": def.name,
            "steps": def.steps.len(),
            "stage_groups": plan.groups.len(),
            "warnings": warnings,
        }));
    }

    if out.json {
        let report = match reports.as_slice() {
            [single] => single.clone(),
            _ => Value::Array(reports),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if out.styled() {
        println!();
    }
    Ok(())
}

pub fn plan(file: &Path, out: Output) -> Result<()> {
    let def = load(file)?;
    let plan = build_execution_plan(&def.steps)?;

    if out.json {
        let report = json!({
            "workflow": def.name,
            "groups": plan.groups,
            "warnings": plan.warnings(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Steps"),
            Cell::new("Depends on"),
        ]);
    for (index, group) in plan.groups.iter().enumerate() {
        let deps: Vec<String> = group
            .iter()
            .filter_map(|id| def.step(id))
            .filter(|step| !step.depends_on.is_empty())
            .map(|step| format!("{} <- {}", step.id, step.depends_on.join(", ")))
            .collect();
        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(group.join(", ")),
            Cell::new(if deps.is_empty() { "-".to_string() } else { deps.join("\n") }),
        ]);
    }

    println!();
    println!("  Execution plan for '{}'", style(&def.name).cyan());
    println!("{table}");
    print_warnings(&plan.warnings());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run / Resume / Cancel
// ---------------------------------------------------------------------------

pub async fn run(state: &AppState, file: &Path, raw_inputs: &[String], out: Output) -> Result<()> {
    let def = load(file)?;
    let inputs = parse_inputs(raw_inputs)?;

    let events = state.executor.events().subscribe();
    let executor = state.executor.clone();
    let task_def = def.clone();
    let handle = tokio::spawn(async move { executor.execute(&task_def, inputs).await });

    let report = follow(state, handle, events, None, out).await?;
    finish(state, &report, out)
}

pub async fn resume(state: &AppState, raw_run_id: &str, file: &Path, out: Output) -> Result<()> {
    let run_id = parse_run_id(raw_run_id)?;
    let def = load(file)?;

    let events = state.executor.events().subscribe();
    let executor = state.executor.clone();
    let handle = tokio::spawn(async move { executor.resume(run_id, &def).await });

    let report = follow(state, handle, events, Some(run_id), out).await?;
    finish(state, &report, out)
}

pub async fn cancel(state: &AppState, raw_run_id: &str, out: Output) -> Result<()> {
    let run_id = parse_run_id(raw_run_id)?;
    let cancelled = state.executor.cancel(run_id).await?;

    if out.json {
        println!("{}", json!({"run_id": run_id, "cancelled": cancelled}));
    } else if !out.quiet {
        if cancelled {
            println!("  {} Cancelled run {run_id}", style("✓").green().bold());
        } else {
            println!("  Run {run_id} already finished; nothing to cancel.");
        }
    }
    Ok(())
}

/// Stream progress events until the run task finishes. The first Ctrl+C
/// pauses the run at the next stage-group boundary.
async fn follow(
    state: &AppState,
    mut handle: JoinHandle<Result<RunReport, ExecutorError>>,
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    mut run_id: Option<uuid::Uuid>,
    out: Output,
) -> Result<RunReport> {
    let mut interrupted = false;
    let mut events_open = true;

    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            event = events.recv(), if events_open => match event {
                Ok(event) => {
                    if let EngineEvent::RunStarted { run_id: id, .. } = &event {
                        run_id.get_or_insert(*id);
                    }
                    show_event(&event, out);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => events_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    if let Some(id) = run_id {
                        // Failed runs are resumable; in-flight attempts re-run on resume.
                        if let Err(e) = state.executor.checkpoints().update_status(id, RunStatus::Failed, None).await {
                            tracing::error!(run_id = %id, error = %e, "failed to mark interrupted run");
                        }
                    }
                    eprintln!("  {} interrupted; resume from the last checkpoint with `gantry resume`", style("✗").red().bold());
                    std::process::exit(130);
                }
                interrupted = true;
                if let Some(id) = run_id {
                    if state.executor.pause(id) && out.styled() {
                        eprintln!(
                            "  {} pausing after the current stage group (Ctrl+C again to force quit)",
                            style("!").yellow().bold()
                        );
                    }
                }
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        show_event(&event, out);
    }
    Ok(joined.context("run task failed")??)
}

fn show_event(event: &EngineEvent, out: Output) {
    if !out.styled() {
        return;
    }
    match event {
        EngineEvent::RunStarted {
            run_id,
            workflow,
            stage_groups,
            resumed,
        } => {
            println!();
            println!(
                "  {} {} '{}' ({} stage groups)  run {}",
                style("▶").cyan().bold(),
                if *resumed { "Resuming" } else { "Running" },
                style(workflow).cyan(),
                stage_groups,
                style(run_id).dim()
            );
        }
        EngineEvent::StepStarted { stage, attempt, .. } if *attempt > 1 => {
            println!("    {} {stage} (attempt {attempt})", style("↻").yellow());
        }
        EngineEvent::StepStarted { .. } => {}
        EngineEvent::StepCompleted {
            stage,
            provider,
            duration_ms,
            ..
        } => {
            println!(
                "    {} {stage} {}",
                style("✓").green(),
                style(format!("[{provider}, {duration_ms} ms]")).dim()
            );
        }
        EngineEvent::StepSkipped { stage, .. } => {
            println!("    {} {stage} {}", style("-").dim(), style("(condition false)").dim());
        }
        EngineEvent::StepFailed {
            stage,
            kind,
            message,
            will_retry,
            ..
        } => {
            let marker = if *will_retry { style("!").yellow() } else { style("✗").red() };
            println!("    {marker} {stage} {}: {message}", style(kind).dim());
        }
        EngineEvent::RunFinished { .. } => {}
    }
}

fn finish(state: &AppState, report: &RunReport, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else if !out.quiet {
        print_report(report);
        let tripped: Vec<_> = state
            .resilience
            .breaker_states()
            .into_iter()
            .filter(|(_, s)| *s != CircuitState::Closed)
            .collect();
        for (provider, circuit) in tripped {
            println!(
                "  {} circuit for '{provider}' is {}",
                style("!").yellow().bold(),
                circuit
            );
        }
    }

    match report.status {
        RunStatus::Completed | RunStatus::Paused | RunStatus::Cancelled => Ok(()),
        status => bail!("run {} finished {status}", report.run_id),
    }
}

fn print_report(report: &RunReport) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Provider"),
            Cell::new("Duration"),
            Cell::new("Tokens"),
        ]);
    for step in &report.steps {
        let status = match step.status {
            StepStatus::Succeeded => Cell::new("succeeded").fg(Color::Green),
            StepStatus::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
            StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(&step.stage),
            status,
            Cell::new(step.attempts),
            Cell::new(step.provider.as_deref().unwrap_or("-")),
            Cell::new(format!("{} ms", step.duration_ms)),
            Cell::new(step.tokens_used),
        ]);
    }

    println!();
    if !report.steps.is_empty() {
        println!("{table}");
    }

    if !report.errors.is_empty() {
        println!();
        println!("  {}", style("Errors").red().bold());
        for failure in &report.errors {
            let field = failure
                .field
                .as_deref()
                .map(|f| format!(" at {f}"))
                .unwrap_or_default();
            println!(
                "    {} [{}]{field}: {}",
                style(&failure.stage).bold(),
                failure.kind,
                failure.message
            );
        }
    }

    if !report.outputs.is_empty() {
        println!();
        println!("  {}", style("Outputs").bold());
        for (name, value) in &report.outputs {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            println!("    {name} = {rendered}");
        }
    }

    print_warnings(&report.warnings);

    let mut summary = Table::new();
    summary.load_preset(presets::NOTHING).add_row(vec![
        Cell::new("  status"),
        status_cell(report.status),
        Cell::new("tokens"),
        Cell::new(report.total_tokens),
    ]);
    println!();
    println!("{summary}");
    if matches!(report.status, RunStatus::Failed | RunStatus::Paused) {
        println!(
            "  Resume with: {}",
            style(format!("gantry resume {} <workflow-file>", report.run_id)).cyan()
        );
    }
    println!();
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("  {} {warning}", style("warning:").yellow().bold());
    }
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type;
/// anything else is a string.
fn parse_inputs(raw: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("input '{pair}' must be KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("input '{pair}' has an empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}
