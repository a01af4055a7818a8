//! Step condition evaluation.
//!
//! Pure function over the run's variable mapping. A condition on a missing
//! variable is false for every operator, so a guarded step never runs on
//! data that does not exist.

use gantry_types::workflow::{Condition, ConditionOperator};
use serde_json::Value;

use super::variables::Variables;

/// Evaluate `condition` against `variables`.
///
/// - `equals` / `not_equals`: JSON equality, numbers compared by value (`1 == 1.0`)
/// - `contains`: substring for strings, element for arrays, key for objects
/// - `greater_than` / `less_than`: numbers only; any other type is false
pub fn evaluate(condition: &Condition, variables: &Variables) -> bool {
    let Some(actual) = variables.get(&condition.field) else {
        return false;
    };
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::NotEquals => !values_equal(actual, expected),
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::GreaterThan => {
            compare_numbers(actual, expected).is_some_and(|o| o.is_gt())
        }
        ConditionOperator::LessThan => compare_numbers(actual, expected).is_some_and(|o| o.is_lt()),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            Value::Number(n) => s.contains(&n.to_string()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}
