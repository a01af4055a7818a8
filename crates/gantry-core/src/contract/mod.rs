//! Role contract enforcement.
//!
//! Steps that claim a role (`params.role`) have their input validated before
//! the provider is called and their output validated after it returns, each
//! against the role's JSON Schema.

pub mod registry;

use gantry_types::contract::ContractDirection;
use thiserror::Error;

pub use registry::ContractRegistry;

/// A payload that failed its role's schema or required context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{direction} contract violation for role '{role}' at '{field}': {message}")]
pub struct ContractViolation {
    pub role: String,
    pub direction: ContractDirection,
    /// JSON pointer into the payload, or the missing context key.
    pub field: String,
    pub message: String,
}

/// Errors loading or compiling contracts.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("failed to read contract file {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse contract file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid {direction} schema for role '{role}': {message}")]
    InvalidSchema {
        role: String,
        direction: ContractDirection,
        message: String,
    },

    #[error("contract for role '{0}' registered twice")]
    Duplicate(String),
}
