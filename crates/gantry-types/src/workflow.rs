//! Workflow domain types for Gantry.
//!
//! Defines the declarative workflow definition (YAML or JSON on disk), the
//! execution tracking types (`WorkflowRun`, `Checkpoint`), and the error
//! taxonomy records that a run accumulates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: a set of steps wired together by `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name. Also used as the workflow id of its runs.
    pub name: String,
    /// Definition version string.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared run inputs keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
    /// Variable names collected into the run report when the run finishes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Steps forming the workflow DAG. Order is irrelevant to scheduling.
    pub steps: Vec<StepDefinition>,
    /// Maximum tokens the whole run may consume.
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    /// Wall-clock budget for the whole run, in seconds.
    #[serde(default = "default_workflow_timeout")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_token_budget() -> u64 {
    100_000
}

fn default_workflow_timeout() -> u64 {
    3600
}

/// A declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    /// Informational type name ("string", "number", ...).
    #[serde(rename = "type", default = "default_input_type")]
    pub input_type: String,
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller does not supply the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_input_type() -> String {
    "string".to_string()
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single unit of work bound to one provider kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow and stable across runs.
    pub id: String,
    /// Provider kind that executes this step (e.g. "shell", "fan_in").
    #[serde(rename = "type")]
    pub step_type: String,
    /// Provider parameters. String values may contain `${name}` placeholders.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Optional guard; the step is skipped when it evaluates to false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt execution timeout in seconds.
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    /// Names this step publishes into the run's variable mapping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Ids of steps that must finish before this one. Accepts a string or a list.
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub depends_on: Vec<String>,
}

impl StepDefinition {
    /// The contract role this step claims, taken from `params.role`.
    pub fn role(&self) -> Option<&str> {
        self.params.get("role").and_then(|v| v.as_str())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_step_timeout() -> u64 {
    300
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop the run once the current stage group finishes.
    #[default]
    Abort,
    /// Record the failure and continue without the step's outputs.
    Skip,
    /// Re-attempt transient failures up to `max_retries`, then abort.
    Retry,
}

/// A comparison of one variable against a literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Variable name (bare or `stepid.output`) looked up in the run's mapping.
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed and cancelled runs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Only failed or paused runs may be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Failed | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// A single execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    /// Name of the workflow definition this run executes.
    pub workflow_id: String,
    pub status: RunStatus,
    /// Most recent stage with a successful checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Resolved workflow inputs (caller values plus defaults).
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Last committed variable mapping.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Every step failure recorded so far.
    #[serde(default)]
    pub errors: Vec<StepFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A fresh pending run for the named workflow.
    pub fn new(workflow_id: impl Into<String>, inputs: serde_json::Map<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            current_stage: None,
            inputs,
            variables: serde_json::Map::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Outcome recorded by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// The attempt was abandoned while in flight; its outcome is unknown.
    Running,
    Success,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown checkpoint status '{other}'")),
        }
    }
}

/// Immutable record of one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Step id this attempt belongs to.
    pub stage: String,
    pub status: CheckpointStatus,
    /// 1-based attempt number within the run's execution of this stage.
    pub attempt: u32,
    /// Set when the step's condition evaluated to false.
    #[serde(default)]
    pub skipped: bool,
    /// Resolved parameters the attempt was issued with.
    pub input: serde_json::Value,
    /// Raw provider result, when one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default)]
    pub metrics: ResourceUsage,
    pub created_at: DateTime<Utc>,
}

/// Resources consumed by one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: u64,
    #[serde(default)]
    pub tokens_used: u64,
    /// Provider that produced the result (the fallback, when one was used).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed workflow or step definition.
    Validation,
    /// The step's own logic failed (unresolved variable, unknown provider, budget).
    Execution,
    /// Timeout, rate limiting or temporary unavailability.
    TransientProvider,
    /// Authorization or other non-retryable provider failure.
    PermanentProvider,
    /// Input or output did not satisfy the role's contract.
    ContractViolation,
    /// The provider's bulkhead refused admission.
    CapacityExceeded,
    /// The provider's circuit breaker rejected the call.
    CircuitOpen,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::TransientProvider => "transient_provider",
            Self::PermanentProvider => "permanent_provider",
            Self::ContractViolation => "contract_violation",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step failure as surfaced on the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Offending field for contract violations (JSON pointer or context key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Providers tried for this attempt, primary first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers_attempted: Vec<String>,
}

impl StepFailure {
    pub fn new(stage: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            kind,
            message: message.into(),
            field: None,
            providers_attempted: Vec::new(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.kind, self.message)?;
        if let Some(field) = &self.field {
            write!(f, " (field {field})")?;
        }
        if !self.providers_attempted.is_empty() {
            write!(f, " (providers: {})", self.providers_attempted.join(", "))?;
        }
        Ok(())
    }
}
