//! Filter conditions
//!
//! The `{field, operator, value, nestedConditions?, logicalOperator}` shape
//! used by filter transforms and workflow branch predicates.
//!
//! A condition's own comparison (when `field` is set) and its nested
//! conditions are combined with `logicalOperator`, evaluated in declared
//! order and short-circuited: `And` stops at the first false operand, `Or`
//! at the first true one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Equal (numbers compare by value)
    #[default]
    Equals,
    /// Not equal
    NotEquals,
    /// Greater than
    GreaterThan,
    /// Greater than or equal
    GreaterThanOrEqual,
    /// Less than
    LessThan,
    /// Less than or equal
    LessThanOrEqual,
    /// Substring or array membership
    Contains,
    /// String prefix
    StartsWith,
    /// String suffix
    EndsWith,
    /// Field value is one of `value` (an array)
    In,
    /// Field value is none of `value` (an array)
    NotIn,
    /// Missing or null
    IsNull,
    /// Present and not null
    IsNotNull,
    /// Present, possibly null
    Exists,
}

/// How a condition's operands combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogicalOperator {
    /// Every operand must hold
    #[default]
    And,
    /// At least one operand must hold
    Or,
}

/// A filter condition, possibly compound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    /// Dotted path of the field to test; empty for a pure group
    #[serde(default)]
    pub field: String,
    /// Comparison operator
    #[serde(default)]
    pub operator: FilterOperator,
    /// Right-hand side
    #[serde(default)]
    pub value: Value,
    /// Child conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested_conditions: Vec<FilterCondition>,
    /// Combinator for own comparison and children
    #[serde(default)]
    pub logical_operator: LogicalOperator,
}

impl FilterCondition {
    /// Simple `field operator value` condition
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            nested_conditions: Vec::new(),
            logical_operator: LogicalOperator::And,
        }
    }

    /// Group of conditions joined by `logical_operator`
    pub fn group(logical_operator: LogicalOperator, conditions: Vec<FilterCondition>) -> Self {
        Self {
            field: String::new(),
            operator: FilterOperator::Equals,
            value: Value::Null,
            nested_conditions: conditions,
            logical_operator,
        }
    }

    /// Evaluate against a JSON document; an empty condition matches
    pub fn evaluate(&self, document: &Value) -> bool {
        let has_own = !self.field.is_empty();
        if !has_own && self.nested_conditions.is_empty() {
            return true;
        }
        match self.logical_operator {
            LogicalOperator::And => {
                (!has_own || self.compare(document))
                    && self.nested_conditions.iter().all(|c| c.evaluate(document))
            }
            LogicalOperator::Or => {
                (has_own && self.compare(document))
                    || self.nested_conditions.iter().any(|c| c.evaluate(document))
            }
        }
    }

    fn compare(&self, document: &Value) -> bool {
        let actual = lookup_path(document, &self.field);
        match self.operator {
            FilterOperator::IsNull => actual.is_none_or(Value::is_null),
            FilterOperator::IsNotNull => actual.is_some_and(|v| !v.is_null()),
            FilterOperator::Exists => actual.is_some(),
            FilterOperator::Equals => actual.is_some_and(|v| loose_eq(v, &self.value)),
            FilterOperator::NotEquals => !actual.is_some_and(|v| loose_eq(v, &self.value)),
            FilterOperator::GreaterThan => ordering(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::GreaterThanOrEqual => matches!(
                ordering(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::LessThan => ordering(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::LessThanOrEqual => matches!(
                ordering(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.iter().any(|i| loose_eq(i, needle)),
                _ => false,
            },
            FilterOperator::StartsWith => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            FilterOperator::EndsWith => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
                _ => false,
            },
            FilterOperator::In => match (actual, &self.value) {
                (Some(v), Value::Array(options)) => options.iter().any(|o| loose_eq(v, o)),
                _ => false,
            },
            FilterOperator::NotIn => match (actual, &self.value) {
                (Some(v), Value::Array(options)) => !options.iter().any(|o| loose_eq(v, o)),
                (None, _) => true,
                _ => false,
            },
        }
    }
}

/// Resolve a dotted path (`a.b.0.c`); numeric segments index arrays
pub fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((as_number(left), as_number(right)), (Some(a), Some(b)) if a == b)
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(&b.to_string())
        }
        _ => false,
    }
}

fn ordering(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => as_number(actual)?.partial_cmp(&as_number(expected)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "total": 150,
            "status": "active",
            "email": "alice@example.com",
            "tags": ["vip", "new"],
            "note": null,
            "customer": {"tier": "gold", "orders": [{"id": 1}, {"id": 2}]}
        })
    }

    #[rstest]
    #[case("total", FilterOperator::GreaterThan, json!(100), true)]
    #[case("total", FilterOperator::GreaterThan, json!(150), false)]
    #[case("total", FilterOperator::GreaterThanOrEqual, json!(150), true)]
    #[case("total", FilterOperator::LessThan, json!("200"), true)]
    #[case("total", FilterOperator::Equals, json!(150.0), true)]
    #[case("status", FilterOperator::Equals, json!("active"), true)]
    #[case("status", FilterOperator::NotEquals, json!("active"), false)]
    #[case("email", FilterOperator::EndsWith, json!("@example.com"), true)]
    #[case("email", FilterOperator::StartsWith, json!("bob"), false)]
    #[case("tags", FilterOperator::Contains, json!("vip"), true)]
    #[case("status", FilterOperator::In, json!(["active", "pending"]), true)]
    #[case("status", FilterOperator::NotIn, json!(["closed"]), true)]
    #[case("note", FilterOperator::IsNull, Value::Null, true)]
    #[case("missing", FilterOperator::IsNull, Value::Null, true)]
    #[case("note", FilterOperator::Exists, Value::Null, true)]
    #[case("note", FilterOperator::IsNotNull, Value::Null, false)]
    #[case("customer.tier", FilterOperator::Equals, json!("gold"), true)]
    #[case("customer.orders.1.id", FilterOperator::Equals, json!(2), true)]
    fn test_simple_conditions(
        #[case] field: &str,
        #[case] operator: FilterOperator,
        #[case] value: Value,
        #[case] expected: bool,
    ) {
        let condition = FilterCondition::new(field, operator, value);
        assert_eq!(condition.evaluate(&doc()), expected);
    }

    #[test]
    fn test_nested_or_group() {
        let condition = FilterCondition::group(
            LogicalOperator::Or,
            vec![
                FilterCondition::new("status", FilterOperator::Equals, json!("closed")),
                FilterCondition::new("total", FilterOperator::GreaterThan, json!(100)),
            ],
        );
        assert!(condition.evaluate(&doc()));
    }

    #[test]
    fn test_own_comparison_combines_with_children() {
        let yaml = r#"
field: status
operator: Equals
value: active
logicalOperator: And
nestedConditions:
  - field: total
    operator: LessThan
    value: 100
"#;
        let condition: FilterCondition = serde_yaml::from_str(yaml).unwrap();
        assert!(!condition.evaluate(&doc()));
    }

    #[test]
    fn test_empty_condition_matches() {
        assert!(FilterCondition::group(LogicalOperator::And, vec![]).evaluate(&doc()));
        assert!(FilterCondition::group(LogicalOperator::Or, vec![]).evaluate(&doc()));
    }

    #[test]
    fn test_lookup_path() {
        let d = doc();
        assert_eq!(lookup_path(&d, "customer.orders.0.id"), Some(&json!(1)));
        assert_eq!(lookup_path(&d, "customer.orders.9.id"), None);
        assert_eq!(lookup_path(&d, "status.deeper"), None);
    }
}
