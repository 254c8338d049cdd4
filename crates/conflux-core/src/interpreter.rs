//! Transform interpreter
//!
//! Compiles a transform list once (regexes, templates) and applies it to
//! JSON objects.

use minijinja::Environment;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::schema::FieldType;
use crate::transforms::{NoMatch, OnError, RegexConfig, TransformConfig};

/// Result of running a record through a program
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Transformed data
    Keep(Map<String, Value>),
    /// Dropped by a filter transform
    Filtered,
}

/// A transform failed for one record
#[derive(Debug)]
pub struct TransformFailure {
    /// The failure
    pub error: Error,
    /// Override declared on the failing transform
    pub on_error: Option<OnError>,
}

enum Step {
    Plain(TransformConfig),
    Regex {
        config: RegexConfig,
        pattern: Regex,
        on_error: Option<OnError>,
    },
    Template {
        fields: Vec<(String, String)>,
        on_error: Option<OnError>,
    },
}

/// A compiled transform list
pub struct Program {
    steps: Vec<Step>,
    templates: Environment<'static>,
}

impl Program {
    /// Compile transforms; invalid regexes and templates are configuration errors
    pub fn compile(transforms: &[TransformConfig]) -> Result<Self> {
        let mut templates = Environment::new();
        let mut steps = Vec::with_capacity(transforms.len());
        for (index, transform) in transforms.iter().enumerate() {
            let step = match transform {
                TransformConfig::Regex { regex, on_error } => {
                    let pattern = Regex::new(&regex.pattern).map_err(|e| {
                        Error::config(format!("invalid regex pattern '{}': {}", regex.pattern, e))
                    })?;
                    Step::Regex {
                        config: regex.clone(),
                        pattern,
                        on_error: *on_error,
                    }
                }
                TransformConfig::Template { template, on_error } => {
                    let mut fields = Vec::with_capacity(template.len());
                    for (target, source) in template {
                        let name = format!("transform{index}.{target}");
                        templates.add_template_owned(name.clone(), source.clone())?;
                        fields.push((target.clone(), name));
                    }
                    Step::Template {
                        fields,
                        on_error: *on_error,
                    }
                }
                other => Step::Plain(other.clone()),
            };
            steps.push(step);
        }
        Ok(Self { steps, templates })
    }

    /// Whether the program has no transforms
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Apply every transform in declared order
    pub fn apply(&self, input: &Map<String, Value>) -> std::result::Result<Outcome, TransformFailure> {
        let mut current = input.clone();
        for step in &self.steps {
            let result = match step {
                Step::Plain(config) => apply_plain(current, config),
                Step::Regex {
                    config, pattern, ..
                } => apply_regex(current, config, pattern).map(Some),
                Step::Template { fields, .. } => self.apply_template(current, fields).map(Some),
            };
            match result {
                Ok(Some(next)) => current = next,
                Ok(None) => return Ok(Outcome::Filtered),
                Err(error) => {
                    return Err(TransformFailure {
                        error,
                        on_error: step.on_error(),
                    });
                }
            }
        }
        Ok(Outcome::Keep(current))
    }

    fn apply_template(
        &self,
        mut obj: Map<String, Value>,
        fields: &[(String, String)],
    ) -> Result<Map<String, Value>> {
        let context = minijinja::Value::from_serialize(&obj);
        let mut rendered = Vec::with_capacity(fields.len());
        for (target, name) in fields {
            let output = self.templates.get_template(name)?.render(&context)?;
            rendered.push((target.clone(), Value::String(output)));
        }
        obj.extend(rendered);
        Ok(obj)
    }
}

impl Step {
    fn on_error(&self) -> Option<OnError> {
        match self {
            Step::Plain(config) => config.on_error(),
            Step::Regex { on_error, .. } | Step::Template { on_error, .. } => *on_error,
        }
    }
}

fn apply_plain(
    obj: Map<String, Value>,
    transform: &TransformConfig,
) -> Result<Option<Map<String, Value>>> {
    let next = match transform {
        TransformConfig::Map { map, .. } => apply_map(obj, map),
        TransformConfig::Rename { rename, .. } => apply_rename(obj, rename),
        TransformConfig::Drop { drop, .. } => apply_drop(obj, drop),
        TransformConfig::AddFields { add_fields, .. } => apply_add_fields(obj, add_fields),
        TransformConfig::Coalesce { coalesce, .. } => apply_coalesce(obj, coalesce),
        TransformConfig::Cast { cast, .. } => apply_cast(obj, cast)?,
        TransformConfig::Filter { filter, .. } => {
            let keep = filter.evaluate(&Value::Object(obj.clone()));
            return Ok(keep.then_some(obj));
        }
        TransformConfig::Regex { .. } | TransformConfig::Template { .. } => {
            return Err(Error::TransformError {
                transform: transform.name().to_string(),
                message: "transform was not compiled".to_string(),
            });
        }
    };
    Ok(Some(next))
}

fn apply_map(obj: Map<String, Value>, mappings: &BTreeMap<String, String>) -> Map<String, Value> {
    let mut output = obj.clone();
    for (output_field, input_field) in mappings {
        let value = obj
            .get(input_field.as_str())
            .cloned()
            .unwrap_or(Value::Null);
        output.insert(output_field.clone(), value);
    }
    output
}

fn apply_rename(
    mut obj: Map<String, Value>,
    renames: &BTreeMap<String, String>,
) -> Map<String, Value> {
    for (from, to) in renames {
        if let Some(value) = obj.shift_remove(from) {
            obj.insert(to.clone(), value);
        }
    }
    obj
}

fn apply_drop(mut obj: Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    for field in fields {
        obj.shift_remove(field);
    }
    obj
}

fn apply_add_fields(
    mut obj: Map<String, Value>,
    fields: &BTreeMap<String, Value>,
) -> Map<String, Value> {
    for (key, value) in fields {
        obj.insert(key.clone(), value.clone());
    }
    obj
}

fn apply_coalesce(
    obj: Map<String, Value>,
    mappings: &BTreeMap<String, Vec<String>>,
) -> Map<String, Value> {
    let mut output = obj.clone();
    for (output_field, source_fields) in mappings {
        let value = source_fields
            .iter()
            .find_map(|f| obj.get(f).filter(|v| !v.is_null()).cloned())
            .unwrap_or(Value::Null);
        output.insert(output_field.clone(), value);
    }
    output
}

fn apply_regex(
    mut obj: Map<String, Value>,
    config: &RegexConfig,
    pattern: &Regex,
) -> Result<Map<String, Value>> {
    let subject = match obj.get(&config.field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let Some(captures) = pattern.captures(&subject) else {
        return match config.on_no_match {
            NoMatch::Null => {
                for output in config.captures.keys() {
                    obj.insert(output.clone(), Value::Null);
                }
                Ok(obj)
            }
            NoMatch::Skip => Ok(obj),
            NoMatch::Error => Err(Error::TransformError {
                transform: "regex".to_string(),
                message: format!(
                    "field '{}' does not match '{}'",
                    config.field, config.pattern
                ),
            }),
        };
    };
    for (output, group) in &config.captures {
        let matched = match group.parse::<usize>() {
            Ok(index) => captures.get(index),
            Err(_) => captures.name(group),
        };
        let value = matched
            .map(|m| Value::String(m.as_str().to_string()))
            .unwrap_or(Value::Null);
        obj.insert(output.clone(), value);
    }
    Ok(obj)
}

fn apply_cast(
    mut obj: Map<String, Value>,
    casts: &BTreeMap<String, FieldType>,
) -> Result<Map<String, Value>> {
    for (field, target) in casts {
        let Some(value) = obj.get(field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let cast = cast_value(value, *target).ok_or_else(|| Error::TransformError {
            transform: "cast".to_string(),
            message: format!("cannot cast field '{}' value {} to {:?}", field, value, target),
        })?;
        obj.insert(field.clone(), cast);
    }
    Ok(obj)
}

fn cast_value(value: &Value, target: FieldType) -> Option<Value> {
    match target {
        FieldType::Any => Some(value.clone()),
        FieldType::String => Some(match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        FieldType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
            Value::Number(n) => n.as_f64().map(|f| Value::from(f.trunc() as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            Value::Bool(b) => Some(Value::from(i64::from(*b))),
            _ => None,
        },
        FieldType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            _ => None,
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|i| Value::Bool(i != 0)),
            _ => None,
        },
        FieldType::Object => value.is_object().then(|| value.clone()),
        FieldType::Array => match value {
            Value::Array(_) => Some(value.clone()),
            other => Some(Value::Array(vec![other.clone()])),
        },
    }
}
