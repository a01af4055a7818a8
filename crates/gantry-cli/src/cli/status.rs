//! Run inspection commands: status and checkpoint log.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use gantry_types::workflow::{CheckpointStatus, WorkflowRun};

use super::workflow::Output;
use super::{parse_run_id, status_cell};
use crate::state::AppState;

/// Show one run (by UUID) or the most recent runs, optionally filtered by
/// workflow name.
pub async fn status(
    state: &AppState,
    target: Option<&str>,
    limit: u32,
    out: Output,
) -> Result<()> {
    let checkpoints = state.executor.checkpoints();

    if let Some(run_id) = target.and_then(|t| t.parse::<uuid::Uuid>().ok()) {
        let run = checkpoints.get_run(run_id).await?;
        return show_run(&run, out);
    }

    let runs = checkpoints.list_runs(target, limit).await?;

    if out.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    println!();
    if runs.is_empty() {
        match target {
            Some(name) => println!("  No runs for workflow '{name}'."),
            None => println!("  No runs recorded in {}.", state.data_dir.display()),
        }
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Last stage"),
            Cell::new("Errors"),
            Cell::new("Updated"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(run.id),
            Cell::new(&run.workflow_id),
            status_cell(run.status),
            Cell::new(run.current_stage.as_deref().unwrap_or("-")),
            Cell::new(run.errors.len()),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

fn show_run(run: &WorkflowRun, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Run").bold(), style(run.id).cyan());
    let mut table = Table::new();
    table.load_preset(presets::NOTHING);
    table.add_row(vec![Cell::new("  workflow"), Cell::new(&run.workflow_id)]);
    table.add_row(vec![Cell::new("  status"), status_cell(run.status)]);
    table.add_row(vec![
        Cell::new("  last successful stage"),
        Cell::new(run.current_stage.as_deref().unwrap_or("-")),
    ]);
    table.add_row(vec![
        Cell::new("  created"),
        Cell::new(run.created_at.to_rfc3339()),
    ]);
    table.add_row(vec![
        Cell::new("  updated"),
        Cell::new(run.updated_at.to_rfc3339()),
    ]);
    table.add_row(vec![Cell::new("  variables"), Cell::new(run.variables.len())]);
    println!("{table}");

    if !run.errors.is_empty() {
        println!();
        println!("  {}", style("Errors").red().bold());
        for failure in &run.errors {
            println!(
                "    {} [{}]: {}",
                style(&failure.stage).bold(),
                failure.kind,
                failure.message
            );
        }
    }
    println!();
    Ok(())
}

/// List a run's checkpoint log, newest first.
pub async fn checkpoints(state: &AppState, raw_run_id: &str, out: Output) -> Result<()> {
    let run_id = parse_run_id(raw_run_id)?;
    let manager = state.executor.checkpoints();
    // Surfaces RunNotFound instead of an empty list for unknown ids.
    manager.get_run(run_id).await?;
    let log = manager.list_checkpoints(run_id).await?;

    if out.json {
        println!("{}", serde_json::to_string_pretty(&log)?);
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
            Cell::new("Time").fg(Color::Cyan),
            Cell::new("Stage"),
            Cell::new("Status"),
            Cell::new("Attempt"),
            Cell::new("Provider"),
            Cell::new("Duration"),
            Cell::new("Tokens"),
            Cell::new("Detail"),
        ]);

    for cp in &log {
        let status = match cp.status {
            CheckpointStatus::Success if cp.skipped => Cell::new("skipped").fg(Color::DarkGrey),
            CheckpointStatus::Success => Cell::new("success").fg(Color::Green),
            CheckpointStatus::Failed => Cell::new("failed").fg(Color::Red),
            CheckpointStatus::Running => Cell::new("running").fg(Color::Yellow),
        };
        let detail = cp
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.kind, e.message))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(cp.created_at.format("%H:%M:%S%.3f").to_string()),
            Cell::new(&cp.stage),
            status,
            Cell::new(cp.attempt),
            Cell::new(cp.metrics.provider.as_deref().unwrap_or("-")),
            Cell::new(format!("{} ms", cp.metrics.duration_ms)),
            Cell::new(cp.metrics.tokens_used),
            Cell::new(detail),
        ]);
    }

    println!();
    println!(
        "  Checkpoints for run {} ({} entries)",
        style(run_id).cyan(),
        log.len()
    );
    println!("{table}");
    println!();
    Ok(())
}
