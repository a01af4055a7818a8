//! Workflow engine core: definition parsing, stage planning, and durable execution.
//!
//! - `definition` -- YAML/JSON parsing, validation, input resolution, file discovery
//! - `dag` -- dependency validation, cycle detection, stage-group computation
//! - `variables` -- run variable mapping and `${name}` substitution
//! - `condition` -- step guard evaluation
//! - `composite` -- `fan_out`, `map_reduce` and `parallel` step kinds
//! - `checkpoint` -- durable run/attempt records and resume-state reconstruction
//! - `step_runner` -- one step through contracts, retries, and the resilient dispatcher
//! - `executor` -- stage-group executor with pause, cancel, and resume

pub mod checkpoint;
pub mod composite;
pub mod condition;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod step_runner;
pub mod variables;
