//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts YAML/JSON documents into `WorkflowDefinition`, validates the
//! structural constraints that do not need the dependency graph (names, unique
//! ids, budgets), resolves run inputs, and discovers definition files on disk.
//! Graph-level checks (dangling references, cycles) live in [`super::dag`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use gantry_types::workflow::WorkflowDefinition;
use serde_json::{Map, Value};
use thiserror::Error;

/// Smallest token budget a workflow may declare.
const MIN_TOKEN_BUDGET: u64 = 1000;

/// Smallest run-level timeout a workflow may declare, in seconds.
const MIN_WORKFLOW_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Validation errors: malformed definitions or inputs. Raised before any
/// step executes and never retried.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural validation failure.
    #[error("invalid workflow: {0}")]
    Invalid(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    /// A `depends_on` entry names a step that does not exist.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The listed steps form (or sit downstream of) a dependency cycle.
    #[error("dependency cycle among steps: {}", steps.join(", "))]
    CycleDetected { steps: Vec<String> },

    #[error("missing required input '{0}'")]
    MissingInput(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and at least one step exists
/// - Every step has a non-empty id and type, and ids are unique
/// - Step timeouts are at least one second
/// - Token budget and run timeout respect their minimums
/// - No two steps publish the same output name (variable keys are unique per run)
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::Invalid(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::Invalid(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::Invalid(
                "step id must not be empty".to_string(),
            ));
        }
        if step.step_type.trim().is_empty() {
            return Err(WorkflowError::Invalid(format!(
                "step '{}' has an empty type",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::DuplicateStep(step.id.clone()));
        }
        if step.timeout_seconds == 0 {
            return Err(WorkflowError::Invalid(format!(
                "step '{}': timeout_seconds must be at least 1",
                step.id
            )));
        }
    }

    if def.token_budget < MIN_TOKEN_BUDGET {
        return Err(WorkflowError::Invalid(format!(
            "token_budget must be at least {MIN_TOKEN_BUDGET}"
        )));
    }

    if def.timeout_seconds < MIN_WORKFLOW_TIMEOUT_SECS {
        return Err(WorkflowError::Invalid(format!(
            "timeout_seconds must be at least {MIN_WORKFLOW_TIMEOUT_SECS}"
        )));
    }

    let mut published = HashSet::new();
    for step in &def.steps {
        for output in &step.outputs {
            if !published.insert(output.as_str()) {
                return Err(WorkflowError::Invalid(format!(
                    "output '{output}' is published by more than one step"
                )));
            }
        }
    }

    Ok(())
}

/// Apply input defaults and check required inputs.
///
/// Caller-supplied values win; declared defaults fill the gaps. Undeclared
/// inputs are passed through unchanged.
pub fn resolve_inputs(
    def: &WorkflowDefinition,
    mut supplied: Map<String, Value>,
) -> Result<Map<String, Value>, WorkflowError> {
    for (name, spec) in &def.inputs {
        if supplied.contains_key(name) {
            continue;
        }
        match &spec.default {
            Some(default) => {
                supplied.insert(name.clone(), default.clone());
            }
            None if spec.required => return Err(WorkflowError::MissingInput(name.clone())),
            None => {}
        }
    }
    Ok(supplied)
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Discover all workflow files under `base_dir`, sorted by path.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_definition = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_definition {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid workflow file"),
        }
    }
    Ok(())
}
