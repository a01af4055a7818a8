//! CLI command definitions for the `gantry` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod status;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use gantry_types::workflow::RunStatus;

/// Run workflow graphs with checkpointing and per-provider resilience.
#[derive(Parser)]
#[command(name = "gantry", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "GANTRY_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check workflow definitions for schema errors, missing dependencies,
    /// cycles and unknown step types.
    Validate {
        /// A workflow YAML or JSON file, or a directory to scan.
        file: PathBuf,
    },

    /// Print the stage groups a workflow would execute in.
    Plan {
        /// Path to a workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Execute a workflow from the beginning.
    Run {
        /// Path to a workflow YAML or JSON file.
        file: PathBuf,

        /// Workflow input as key=value (value parsed as JSON when possible). Repeatable.
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },

    /// Resume a failed or paused run from its checkpoints.
    Resume {
        /// Run UUID.
        run_id: String,

        /// Path to the workflow file the run was started from.
        file: PathBuf,
    },

    /// Cancel a paused or failed run so it can no longer be resumed.
    Cancel {
        /// Run UUID.
        run_id: String,
    },

    /// Show a run, or recent runs (optionally for one workflow).
    Status {
        /// Run UUID or workflow name (omit for all recent runs).
        target: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// List a run's checkpoint log, newest first.
    Checkpoints {
        /// Run UUID.
        run_id: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Colored table cell for a run status.
pub fn status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Running => Color::Cyan,
        RunStatus::Paused => Color::Yellow,
        RunStatus::Pending | RunStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

/// Parse a run id argument.
pub fn parse_run_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("'{raw}' is not a valid run id"))
}
