//! Role contracts.
//!
//! A contract pairs an input schema with an output schema (JSON Schema
//! documents) for every step that claims a role via `params.role`.

use serde::{Deserialize, Serialize};

/// Input/output schema pair a role must satisfy. Read-only after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "permissive_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default = "permissive_schema")]
    pub output_schema: serde_json::Value,
    /// Variable names that must be resolvable before the step runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_context: Vec<String>,
}

fn permissive_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// Which side of a step a contract check applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractDirection {
    Input,
    Output,
}

impl std::fmt::Display for ContractDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_schemas_default_to_object() {
        let contract: Contract = serde_yaml_ng::from_str("role: reviewer\n").unwrap();
        assert_eq!(contract.input_schema, serde_json::json!({"type": "object"}));
        assert_eq!(contract.output_schema, serde_json::json!({"type": "object"}));
        assert!(contract.required_context.is_empty());
    }
}
