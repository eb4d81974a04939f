//! Variable comparisons used by branch nodes and loop conditions.

use crate::{Value, VariablePool};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains")]
    NotContains,
    #[serde(rename = "start with")]
    StartWith,
    #[serde(rename = "end with")]
    EndWith,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty")]
    NotEmpty,
    #[serde(rename = "=", alias = "==")]
    Equal,
    #[serde(rename = "≠", alias = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "≥", alias = ">=")]
    GreaterOrEqual,
    #[serde(rename = "≤", alias = "<=")]
    LessOrEqual,
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "not null")]
    NotNull,
}

/// A single comparison between a variable and an expected value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable_selector: Vec<String>,
    pub comparison_operator: ComparisonOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Conditions joined by one logical operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Condition {
    pub fn new(
        selector: &[&str],
        comparison_operator: ComparisonOperator,
        value: serde_json::Value,
    ) -> Self {
        Self {
            variable_selector: selector.iter().map(|s| s.to_string()).collect(),
            comparison_operator,
            value,
        }
    }

    /// Evaluate against the pool. A missing variable compares as null.
    pub fn evaluate(&self, pool: &VariablePool) -> bool {
        let actual = pool.get(&self.variable_selector).unwrap_or(Value::Null);
        compare(&actual, self.comparison_operator, &self.value)
    }
}

impl ConditionGroup {
    /// An empty group is vacuously true.
    pub fn evaluate(&self, pool: &VariablePool) -> bool {
        match self.logical_operator {
            LogicalOperator::And => self.conditions.iter().all(|c| c.evaluate(pool)),
            LogicalOperator::Or => {
                self.conditions.is_empty() || self.conditions.iter().any(|c| c.evaluate(pool))
            }
        }
    }
}

fn compare(actual: &Value, operator: ComparisonOperator, expected: &serde_json::Value) -> bool {
    use ComparisonOperator::*;

    let expected_text = match expected {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };

    match operator {
        Empty => actual.is_empty(),
        NotEmpty => !actual.is_empty(),
        Null => actual.is_null(),
        NotNull => !actual.is_null(),
        Contains => contains(actual, expected),
        NotContains => !contains(actual, expected),
        StartWith => actual.to_text().starts_with(&expected_text),
        EndWith => actual.to_text().ends_with(&expected_text),
        Is => actual.to_text() == expected_text,
        IsNot => actual.to_text() != expected_text,
        Equal | NotEqual | GreaterThan | LessThan | GreaterOrEqual | LessOrEqual => {
            let ordering = match (as_number(actual), json_number(expected)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(actual.to_text().cmp(&expected_text)),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match operator {
                Equal => ordering.is_eq(),
                NotEqual => ordering.is_ne(),
                GreaterThan => ordering.is_gt(),
                LessThan => ordering.is_lt(),
                GreaterOrEqual => ordering.is_ge(),
                _ => ordering.is_le(),
            }
        }
    }
}

fn contains(actual: &Value, expected: &serde_json::Value) -> bool {
    match actual {
        Value::Array(items) => {
            let needle = Value::from_json(expected.clone());
            items
                .iter()
                .any(|item| item == &needle || item.to_text() == needle.to_text())
        }
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        other => {
            let needle = match expected {
                serde_json::Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            other.to_text().contains(&needle)
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(_) | Value::Float(_) => value.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool() -> VariablePool {
        let pool = VariablePool::new();
        pool.add(&["a", "count"], Value::from(3i64)).unwrap();
        pool.add(&["a", "name"], Value::from("workflow engine")).unwrap();
        pool.add(&["a", "tags"], Value::from_json(json!(["x", "y"]))).unwrap();
        pool
    }

    #[test]
    fn numeric_comparisons() {
        let pool = pool();
        let cond = Condition::new(&["a", "count"], ComparisonOperator::LessThan, json!(5));
        assert!(cond.evaluate(&pool));
        let cond = Condition::new(&["a", "count"], ComparisonOperator::GreaterOrEqual, json!("4"));
        assert!(!cond.evaluate(&pool));
    }

    #[test]
    fn string_and_array_operators() {
        let pool = pool();
        assert!(Condition::new(&["a", "name"], ComparisonOperator::StartWith, json!("work"))
            .evaluate(&pool));
        assert!(Condition::new(&["a", "tags"], ComparisonOperator::Contains, json!("y"))
            .evaluate(&pool));
        assert!(Condition::new(&["a", "missing"], ComparisonOperator::Empty, json!(null))
            .evaluate(&pool));
    }

    #[test]
    fn group_operators() {
        let pool = pool();
        let group = ConditionGroup {
            logical_operator: LogicalOperator::Or,
            conditions: vec![
                Condition::new(&["a", "count"], ComparisonOperator::Equal, json!(1)),
                Condition::new(&["a", "name"], ComparisonOperator::Contains, json!("engine")),
            ],
        };
        assert!(group.evaluate(&pool));

        let and_group = ConditionGroup {
            logical_operator: LogicalOperator::And,
            ..group
        };
        assert!(!and_group.evaluate(&pool));
    }

    #[test]
    fn operators_deserialize_from_symbols() {
        let cond: Condition = serde_json::from_value(json!({
            "variable_selector": ["a", "count"],
            "comparison_operator": ">=",
            "value": 3
        }))
        .unwrap();
        assert_eq!(cond.comparison_operator, ComparisonOperator::GreaterOrEqual);
    }
}
