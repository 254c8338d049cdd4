//! Business-rule validation
//!
//! Rules are declared on a source definition (`validationRules`) or in a
//! run's validation config, compiled once into a [`RuleSet`], and checked
//! per record together with the record's schema.
//!
//! ```yaml
//! rules:
//!   - field: email
//!     rule: required
//!   - field: email
//!     rule:
//!       pattern: "^[^@]+@[^@]+$"
//!   - field: total
//!     rule:
//!       range: { min: 0 }
//! abortOnFirstFailure: false
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::schema::{FieldType, SchemaCatalog, json_type_name};

/// The check a rule performs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleKind {
    /// Present and non-null
    Required,
    /// String matches the regex
    Pattern(String),
    /// Number within bounds (inclusive)
    Range {
        /// Lower bound
        #[serde(default)]
        min: Option<f64>,
        /// Upper bound
        #[serde(default)]
        max: Option<f64>,
    },
    /// Value is one of the listed values
    OneOf(Vec<Value>),
    /// Value has the given type
    Type(FieldType),
    /// String or array has at least n elements
    MinLength(usize),
    /// String or array has at most n elements
    MaxLength(usize),
}

/// One rule against one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    /// Field name
    pub field: String,
    /// Check to perform
    pub rule: RuleKind,
    /// Message overriding the generated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationRule {
    /// Rule with the generated message
    pub fn new(field: impl Into<String>, rule: RuleKind) -> Self {
        Self {
            field: field.into(),
            rule,
            message: None,
        }
    }
}

/// Validation settings for one run or step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Rules in addition to the source definition's own
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
    /// Schema to validate against when records carry none
    #[serde(default)]
    pub schema_id: Option<String>,
    /// Abort the run on the first invalid record instead of rejecting it
    #[serde(default)]
    pub abort_on_first_failure: bool,
}

enum CompiledCheck {
    Required,
    Pattern(Regex),
    Range(Option<f64>, Option<f64>),
    OneOf(Vec<Value>),
    Type(FieldType),
    MinLength(usize),
    MaxLength(usize),
}

struct CompiledRule {
    field: String,
    check: CompiledCheck,
    message: Option<String>,
}

/// Rules compiled for repeated evaluation
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile rules; an invalid pattern is a configuration error
    pub fn compile<'a>(rules: impl IntoIterator<Item = &'a ValidationRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let check = match &rule.rule {
                    RuleKind::Required => CompiledCheck::Required,
                    RuleKind::Pattern(pattern) => {
                        CompiledCheck::Pattern(Regex::new(pattern).map_err(|e| {
                            Error::config(format!(
                                "invalid pattern '{}' for field '{}': {}",
                                pattern, rule.field, e
                            ))
                        })?)
                    }
                    RuleKind::Range { min, max } => CompiledCheck::Range(*min, *max),
                    RuleKind::OneOf(values) => CompiledCheck::OneOf(values.clone()),
                    RuleKind::Type(t) => CompiledCheck::Type(*t),
                    RuleKind::MinLength(n) => CompiledCheck::MinLength(*n),
                    RuleKind::MaxLength(n) => CompiledCheck::MaxLength(*n),
                };
                Ok(CompiledRule {
                    field: rule.field.clone(),
                    check,
                    message: rule.message.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Number of compiled rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every rule violation of `record`
    pub fn violations(&self, record: &Record) -> Vec<String> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let value = record.get(&rule.field).filter(|v| !v.is_null());
                let failure = check(&rule.check, &rule.field, value)?;
                Some(rule.message.clone().unwrap_or(failure))
            })
            .collect()
    }
}

fn check(check: &CompiledCheck, field: &str, value: Option<&Value>) -> Option<String> {
    let Some(value) = value else {
        return matches!(check, CompiledCheck::Required)
            .then(|| format!("field '{field}' is required"));
    };
    match check {
        CompiledCheck::Required => None,
        CompiledCheck::Pattern(re) => match value.as_str() {
            Some(s) if re.is_match(s) => None,
            _ => Some(format!("field '{field}' does not match '{}'", re.as_str())),
        },
        CompiledCheck::Range(min, max) => {
            let Some(n) = value.as_f64() else {
                return Some(format!("field '{field}' is not a number"));
            };
            let below = min.is_some_and(|m| n < m);
            let above = max.is_some_and(|m| n > m);
            (below || above).then(|| format!("field '{field}' value {n} is out of range"))
        }
        CompiledCheck::OneOf(options) => (!options.contains(value))
            .then(|| format!("field '{field}' value {value} is not an allowed value")),
        CompiledCheck::Type(t) => (!t.matches(value)).then(|| {
            format!(
                "field '{field}' expected {:?}, got {}",
                t,
                json_type_name(value)
            )
        }),
        CompiledCheck::MinLength(n) => {
            (length(value) < Some(*n)).then(|| format!("field '{field}' is shorter than {n}"))
        }
        CompiledCheck::MaxLength(n) => length(value)
            .is_some_and(|len| len > *n)
            .then(|| format!("field '{field}' is longer than {n}")),
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Validate one record against its schema and the rule set
///
/// A record whose schema id (or the configured fallback) is not in the
/// catalog is a configuration error, not a rejection.
pub fn validate_record(
    record: &Record,
    rules: &RuleSet,
    catalog: &SchemaCatalog,
    fallback_schema: Option<&str>,
) -> Result<Vec<String>> {
    let mut violations = Vec::new();
    if let Some(schema_id) = record.schema_id.as_deref().or(fallback_schema) {
        let schema = catalog.get(schema_id).ok_or_else(|| {
            Error::config(format!(
                "record '{}' references unknown schema '{}'",
                record.id, schema_id
            ))
        })?;
        violations.extend(schema.violations(&record.data));
    }
    violations.extend(rules.violations(record));
    Ok(violations)
}
