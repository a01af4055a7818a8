//! Providers that run inside the engine process.

use gantry_types::error::ProviderError;
use serde_json::{Value, json};

use super::{ProviderRequest, StepProvider};

/// Returns its resolved parameters as the step result.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProvider;

impl StepProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        Ok(Value::Object(request.params.clone()))
    }
}

/// Gathers a list of upstream results into one value.
///
/// Params:
/// - `items` (or `input`): the values to gather; a non-list is one item
/// - `aggregation`: `concat` (default) joins items into one string,
///   `list` returns them unchanged
/// - `separator`: join string for `concat`, default `"\n"`
#[derive(Debug, Default, Clone, Copy)]
pub struct FanInProvider;

impl StepProvider for FanInProvider {
    fn name(&self) -> &str {
        "fan_in"
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        let items = match request
            .params
            .get("items")
            .or_else(|| request.params.get("input"))
        {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
        let aggregation = request.param_str("aggregation").unwrap_or("concat");

        let response = match aggregation {
            "concat" => {
                let separator = request.param_str("separator").unwrap_or("\n");
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(separator);
                Value::String(joined)
            }
            "list" => Value::Array(items.clone()),
            other => {
                return Err(ProviderError::permanent(format!(
                    "unknown aggregation type '{other}'"
                )));
            }
        };

        Ok(json!({
            "response": response,
            "aggregation_type": aggregation,
            "item_count": items.len(),
            "tokens_used": 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn request(action: &str, params: Value) -> ProviderRequest {
        let params: Map<String, Value> = serde_json::from_value(params).unwrap();
        ProviderRequest {
            run_id: uuid::Uuid::now_v7(),
            stage: "gather".into(),
            action: action.into(),
            params,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_params() {
        let out = EchoProvider
            .invoke(&request("echo", json!({"message": "hi", "n": 2})))
            .await
            .unwrap();
        assert_eq!(out, json!({"message": "hi", "n": 2}));
    }

    #[tokio::test]
    async fn test_fan_in_concat() {
        let out = FanInProvider
            .invoke(&request("fan_in", json!({"items": ["a", 2, "c"], "separator": ", "})))
            .await
            .unwrap();
        assert_eq!(out["response"], json!("a, 2, c"));
        assert_eq!(out["aggregation_type"], json!("concat"));
        assert_eq!(out["item_count"], json!(3));
    }

    #[tokio::test]
    async fn test_fan_in_default_separator_and_scalar_input() {
        let out = FanInProvider
            .invoke(&request("fan_in", json!({"input": "only"})))
            .await
            .unwrap();
        assert_eq!(out["response"], json!("only"));
        assert_eq!(out["item_count"], json!(1));

        let out = FanInProvider
            .invoke(&request("fan_in", json!({"items": ["x", "y"]})))
            .await
            .unwrap();
        assert_eq!(out["response"], json!("x\ny"));
    }

    #[tokio::test]
    async fn test_fan_in_list_and_unknown() {
        let out = FanInProvider
            .invoke(&request("fan_in", json!({"items": [1, 2], "aggregation": "list"})))
            .await
            .unwrap();
        assert_eq!(out["response"], json!([1, 2]));

        let err = FanInProvider
            .invoke(&request("fan_in", json!({"items": [], "aggregation": "vote"})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
