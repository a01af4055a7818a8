//! Run variable mapping and `${name}` interpolation.
//!
//! The mapping holds workflow inputs plus every output published by a
//! finished step, under both its bare name and `stepid.name`. Parameters are
//! substituted with a small explicit parser: every `${...}` must resolve or
//! the whole substitution fails with a [`TemplateError`].

use gantry_types::workflow::StepDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unresolved variable '${{{name}}}'")]
    Unresolved { name: String },

    #[error("unterminated placeholder starting at byte {position}")]
    Unterminated { position: usize },

    #[error("empty placeholder at byte {position}")]
    EmptyName { position: usize },
}

/// Accumulated named values of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables {
    values: Map<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Resolve a name.
    ///
    /// An exact key wins (`build.artifact` as published by step `build`).
    /// Otherwise the name is treated as a path: the first segment selects a
    /// variable and the rest index into objects by key or arrays by position.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.values.get(name) {
            return Some(value);
        }
        let mut segments = name.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Publish a step's declared outputs from its raw result.
    ///
    /// Each declared name found in an object result is published. The first
    /// declared name falls back to the result's `response` or `stdout` field,
    /// or to the whole result when it is not an object. Returns the names
    /// published (bare form).
    pub fn merge_step_outputs(&mut self, step: &StepDefinition, output: &Value) -> Vec<String> {
        let mut published = Vec::new();
        for (index, name) in step.outputs.iter().enumerate() {
            let value = match output {
                Value::Object(fields) => fields.get(name).or_else(|| {
                    if index == 0 {
                        fields.get("response").or_else(|| fields.get("stdout"))
                    } else {
                        None
                    }
                }),
                other if index == 0 => Some(other),
                _ => None,
            };
            if let Some(value) = value {
                self.values.insert(name.clone(), value.clone());
                self.values
                    .insert(format!("{}.{}", step.id, name), value.clone());
                published.push(name.clone());
            }
        }
        published
    }

    // -----------------------------------------------------------------------
    // Interpolation
    // -----------------------------------------------------------------------

    /// Substitute placeholders in one string.
    ///
    /// A string that is exactly one placeholder yields the referenced value
    /// unchanged (numbers stay numbers, lists stay lists); anything else is
    /// rendered into a string. `$${` produces a literal `${`.
    pub fn interpolate(&self, template: &str) -> Result<Value, TemplateError> {
        let segments = parse_template(template)?;
        if let [Segment::Placeholder(name)] = segments.as_slice() {
            return self
                .get(name)
                .cloned()
                .ok_or_else(|| TemplateError::Unresolved { name: name.clone() });
        }

        let mut rendered = String::with_capacity(template.len());
        for segment in segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(&text),
                Segment::Placeholder(name) => {
                    let value = self
                        .get(&name)
                        .ok_or(TemplateError::Unresolved { name: name.clone() })?;
                    rendered.push_str(&render(value));
                }
            }
        }
        Ok(Value::String(rendered))
    }

    /// Substitute placeholders in every string nested inside `value`.
    pub fn substitute(&self, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.interpolate(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.substitute_params(map).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Substitute placeholders in a step's parameter map.
    pub fn substitute_params(&self, params: &Map<String, Value>) -> Result<Map<String, Value>, TemplateError> {
        params
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.substitute(value)?)))
            .collect()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

fn parse_template(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("${") {
        if rest[..start].ends_with('$') {
            literal.push_str(&rest[..start - 1]);
            literal.push_str("${");
            rest = &rest[start + 2..];
            offset += start + 2;
            continue;
        }

        literal.push_str(&rest[..start]);
        let position = offset + start;
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or(TemplateError::Unterminated { position })?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(TemplateError::EmptyName { position });
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Placeholder(name.to_string()));

        let consumed = start + 2 + end + 1;
        rest = &rest[consumed..];
        offset += consumed;
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        let mut v = Variables::new();
        v.insert("topic", json!("rust"));
        v.insert("count", json!(3));
        v.insert("plan.steps", json!(["a", "b"]));
        v.insert("meta", json!({"owner": {"name": "ops"}, "tags": ["x", "y"]}));
        v
    }

    #[test]
    fn test_interpolate_mixed_text() {
        let out = vars().interpolate("learn ${topic} in ${count} days").unwrap();
        assert_eq!(out, json!("learn rust in 3 days"));
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        assert_eq!(vars().interpolate("${count}").unwrap(), json!(3));
        assert_eq!(vars().interpolate("${plan.steps}").unwrap(), json!(["a", "b"]));
        assert_eq!(vars().interpolate("${ topic }").unwrap(), json!("rust"));
    }

    #[test]
    fn test_path_lookup() {
        let v = vars();
        assert_eq!(v.get("meta.owner.name"), Some(&json!("ops")));
        assert_eq!(v.get("meta.tags.1"), Some(&json!("y")));
        assert_eq!(v.get("meta.tags.9"), None);
        assert_eq!(v.get("topic.length"), None);
    }

    #[test]
    fn test_unresolved_is_error() {
        let err = vars().interpolate("hello ${missing}").unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unresolved {
                name: "missing".into()
            }
        );
    }

    #[test]
    fn test_malformed_placeholders() {
        assert!(matches!(
            vars().interpolate("x ${topic"),
            Err(TemplateError::Unterminated { position: 2 })
        ));
        assert!(matches!(
            vars().interpolate("${ }"),
            Err(TemplateError::EmptyName { position: 0 })
        ));
    }

    #[test]
    fn test_escape_and_plain_text() {
        assert_eq!(vars().interpolate("cost $${topic}").unwrap(), json!("cost ${topic}"));
        assert_eq!(vars().interpolate("$5 and {braces}").unwrap(), json!("$5 and {braces}"));
        assert_eq!(vars().interpolate("").unwrap(), json!(""));
    }

    #[test]
    fn test_substitute_nested_params() {
        let params = json!({
            "command": "echo ${topic}",
            "items": ["${count}", 7, {"deep": "${meta.owner.name}"}],
            "flag": true
        });
        let out = vars().substitute(&params).unwrap();
        assert_eq!(
            out,
            json!({"command": "echo rust", "items": [3, 7, {"deep": "ops"}], "flag": true})
        );
    }

    #[test]
    fn test_merge_step_outputs_both_keys() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "build",
            "type": "shell",
            "outputs": ["artifact", "log"]
        }))
        .unwrap();
        let mut v = Variables::new();
        let published = v.merge_step_outputs(&step, &json!({"stdout": "bin/app", "log": "ok", "other": 1}));

        assert_eq!(published, vec!["artifact", "log"]);
        assert_eq!(v.get("artifact"), Some(&json!("bin/app")));
        assert_eq!(v.get("build.artifact"), Some(&json!("bin/app")));
        assert_eq!(v.get("build.log"), Some(&json!("ok")));
        assert!(!v.contains("other"));
    }

    #[test]
    fn test_merge_scalar_output_goes_to_first_name() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "count",
            "type": "echo",
            "outputs": ["total", "unused"]
        }))
        .unwrap();
        let mut v = Variables::new();
        assert_eq!(v.merge_step_outputs(&step, &json!(42)), vec!["total"]);
        assert_eq!(v.get("count.total"), Some(&json!(42)));
        assert!(!v.contains("unused"));
    }
}
