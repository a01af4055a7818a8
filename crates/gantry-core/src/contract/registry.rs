//! Compiled contract registry.
//!
//! Schemas compile once when a contract is registered; a schema that does not
//! compile is rejected at load time rather than on first use.

use std::collections::HashMap;
use std::path::Path;

use gantry_types::contract::{Contract, ContractDirection};
use jsonschema::JSONSchema;
use jsonschema::error::ValidationErrorKind;
use serde_json::Value;

use super::{ContractError, ContractViolation};
use crate::workflow::variables::Variables;

struct CompiledContract {
    contract: Contract,
    input: JSONSchema,
    output: JSONSchema,
}

/// Role-keyed contracts. Read-only once the executor is built.
#[derive(Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, CompiledContract>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a contract.
    pub fn register(&mut self, contract: Contract) -> Result<(), ContractError> {
        if self.contracts.contains_key(&contract.role) {
            return Err(ContractError::Duplicate(contract.role));
        }
        let input = compile(&contract, ContractDirection::Input, &contract.input_schema)?;
        let output = compile(&contract, ContractDirection::Output, &contract.output_schema)?;
        tracing::debug!(role = %contract.role, "registered contract");
        self.contracts.insert(
            contract.role.clone(),
            CompiledContract {
                contract,
                input,
                output,
            },
        );
        Ok(())
    }

    /// Load every `.yaml`, `.yml` and `.json` contract file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, ContractError> {
        let mut registry = Self::new();
        let entries = std::fs::read_dir(dir).map_err(|e| ContractError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml" | "json")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let display = path.display().to_string();
            let content = std::fs::read_to_string(&path).map_err(|e| ContractError::Io {
                path: display.clone(),
                message: e.to_string(),
            })?;
            let contract: Contract = if path.extension().is_some_and(|e| e == "json") {
                serde_json::from_str(&content).map_err(|e| ContractError::Parse {
                    path: display.clone(),
                    message: e.to_string(),
                })?
            } else {
                serde_yaml_ng::from_str(&content).map_err(|e| ContractError::Parse {
                    path: display.clone(),
                    message: e.to_string(),
                })?
            };
            registry.register(contract)?;
        }

        tracing::info!(dir = %dir.display(), count = registry.len(), "loaded contracts");
        Ok(registry)
    }

    pub fn get(&self, role: &str) -> Option<&Contract> {
        self.contracts.get(role).map(|c| &c.contract)
    }

    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.contracts.keys().map(String::as_str).collect();
        roles.sort_unstable();
        roles
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Check a step's input payload and required context.
    ///
    /// Roles without a registered contract always pass.
    pub fn validate_input(
        &self,
        role: &str,
        payload: &Value,
        variables: &Variables,
    ) -> Result<(), ContractViolation> {
        let Some(compiled) = self.contracts.get(role) else {
            return Ok(());
        };

        if let Some(missing) = compiled
            .contract
            .required_context
            .iter()
            .find(|key| !variables.contains(key))
        {
            return Err(ContractViolation {
                role: role.to_string(),
                direction: ContractDirection::Input,
                field: missing.clone(),
                message: format!("required context '{missing}' is not available"),
            });
        }

        check(role, ContractDirection::Input, &compiled.input, payload)
    }

    /// Check a step's output payload. Roles without a contract always pass.
    pub fn validate_output(&self, role: &str, payload: &Value) -> Result<(), ContractViolation> {
        match self.contracts.get(role) {
            Some(compiled) => check(role, ContractDirection::Output, &compiled.output, payload),
            None => Ok(()),
        }
    }
}

fn compile(
    contract: &Contract,
    direction: ContractDirection,
    schema: &Value,
) -> Result<JSONSchema, ContractError> {
    JSONSchema::compile(schema).map_err(|e| ContractError::InvalidSchema {
        role: contract.role.clone(),
        direction,
        message: e.to_string(),
    })
}

fn check(
    role: &str,
    direction: ContractDirection,
    schema: &JSONSchema,
    payload: &Value,
) -> Result<(), ContractViolation> {
    let Err(errors) = schema.validate(payload) else {
        return Ok(());
    };

    let mut field = None;
    let mut messages = Vec::new();
    for error in errors {
        if field.is_none() {
            let path = error.instance_path.to_string();
            field = Some(match &error.kind {
                ValidationErrorKind::Required { property } => {
                    let name = property
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| property.to_string());
                    format!("{}/{name}", path.trim_end_matches('/'))
                }
                _ if path.is_empty() => "/".to_string(),
                _ => path,
            });
        }
        messages.push(error.to_string());
    }

    Err(ContractViolation {
        role: role.to_string(),
        direction,
        field: field.unwrap_or_else(|| "/".to_string()),
        message: messages.join("; "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn planner() -> Contract {
        Contract {
            role: "planner".to_string(),
            description: "Breaks a request into tasks".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["request"],
                "properties": {"request": {"type": "string"}}
            }),
            output_schema: json!({
                "type": "object",
                "required": ["tasks"],
                "properties": {
                    "tasks": {"type": "array", "items": {"type": "string"}, "minItems": 1}
                }
            }),
            required_context: vec!["feature_request".to_string()],
        }
    }

    fn registry() -> ContractRegistry {
        let mut registry = ContractRegistry::new();
        registry.register(planner()).unwrap();
        registry
    }

    fn context() -> Variables {
        let mut v = Variables::new();
        v.insert("feature_request", json!("add login"));
        v
    }

    #[test]
    fn test_valid_input_and_output() {
        let r = registry();
        r.validate_input("planner", &json!({"request": "add login"}), &context())
            .unwrap();
        r.validate_output("planner", &json!({"tasks": ["design", "build"]}))
            .unwrap();
    }

    #[test]
    fn test_missing_required_property_names_field() {
        let violation = registry()
            .validate_output("planner", &json!({"summary": "nothing"}))
            .unwrap_err();
        assert_eq!(violation.direction, ContractDirection::Output);
        assert_eq!(violation.field, "/tasks");
        assert_eq!(violation.role, "planner");
    }

    #[test]
    fn test_wrong_type_points_at_nested_field() {
        let violation = registry()
            .validate_output("planner", &json!({"tasks": ["ok", 5]}))
            .unwrap_err();
        assert_eq!(violation.field, "/tasks/1");
    }

    #[test]
    fn test_missing_required_context() {
        let violation = registry()
            .validate_input("planner", &json!({"request": "x"}), &Variables::new())
            .unwrap_err();
        assert_eq!(violation.direction, ContractDirection::Input);
        assert_eq!(violation.field, "feature_request");
    }

    #[test]
    fn test_unknown_role_passes() {
        let r = registry();
        r.validate_output("reviewer", &json!(null)).unwrap();
        r.validate_input("reviewer", &json!(1), &Variables::new()).unwrap();
    }

    #[test]
    fn test_invalid_schema_rejected_at_register() {
        let mut contract = planner();
        contract.output_schema = json!({"type": "not-a-type"});
        let err = ContractRegistry::new().register(contract).unwrap_err();
        assert!(matches!(
            err,
            ContractError::InvalidSchema {
                direction: ContractDirection::Output,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let mut r = registry();
        assert!(matches!(r.register(planner()), Err(ContractError::Duplicate(_))));
    }

    #[test]
    fn test_load_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("builder.yaml"),
            r#"
role: builder
input_schema:
  type: object
  required: [plan]
output_schema:
  type: object
  required: [files]
required_context: [plan]
"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("tester.json"),
            r#"{"role": "tester", "output_schema": {"type": "object", "required": ["passed"]}}"#,
        )
        .unwrap();
        std::fs::write(tmp.path().join("README.md"), "not a contract").unwrap();

        let r = ContractRegistry::load_dir(tmp.path()).unwrap();
        assert_eq!(r.roles(), vec!["builder", "tester"]);
        assert_eq!(r.get("builder").unwrap().required_context, vec!["plan"]);
        assert!(r.validate_output("tester", &json!({"passed": true})).is_ok());
    }

    #[test]
    fn test_load_dir_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.yaml"), "role: [unclosed").unwrap();
        assert!(matches!(
            ContractRegistry::load_dir(tmp.path()),
            Err(ContractError::Parse { .. })
        ));
    }
}
