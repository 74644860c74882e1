//! The `if` preset: rule groups over transition variables
//!
//! Conditions are nested groups:
//!
//! ```json
//! {"condition": "AND", "rules": [
//!     {"field": "session.name", "operator": "is_not_empty"},
//!     {"condition": "OR", "rules": [
//!         {"field": "session.age", "operator": "greater_than", "value": 17},
//!         {"field": "session.guardian", "operator": "equals", "value": true}
//!     ]}
//! ]}
//! ```
//!
//! An empty group is true. Fields are dotted paths into the transition
//! context; a path with no match there is retried under `session.`.

use super::{Preset, PresetContext};
use crate::variables::get_path;
use regex::Regex;
use sdk::errors::EngineError;
use sdk::labels;
use serde::Deserialize;
use serde_json::Value;

/// How the rules of a group combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Combinator {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Rule operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
    LengthGreaterThan,
    LengthLessThan,
    LengthEquals,
    BeginsWith,
    EndsWith,
    Matches,
}

/// A single comparison
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rule {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

/// A group of rules and nested groups
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleGroup {
    #[serde(default)]
    pub condition: Combinator,
    pub rules: Vec<RuleNode>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Group(RuleGroup),
    Rule(Rule),
}

fn malformed(message: impl Into<String>) -> EngineError {
    EngineError::PresetEvaluation(message.into())
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Equality that treats `"5"` and `5`, or `"true"` and `true`, as equal
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) if left.is_number() || right.is_number() => a == b,
        _ => !left.is_object() && !right.is_object() && as_text(left) == as_text(right),
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn length(value: Option<&Value>) -> usize {
    match value {
        Some(Value::String(s)) => s.chars().count(),
        Some(Value::Array(items)) => items.len(),
        Some(Value::Object(map)) => map.len(),
        Some(Value::Null) | None => 0,
        Some(other) => as_text(other).chars().count(),
    }
}

fn expected_number(rule: &Rule) -> Result<f64, EngineError> {
    as_number(&rule.value).ok_or_else(|| {
        malformed(format!(
            "operator {:?} on '{}' needs a numeric value",
            rule.operator, rule.field
        ))
    })
}

fn candidates(expected: &Value) -> Vec<Value> {
    match expected {
        Value::Array(items) => items.clone(),
        Value::String(s) => s.split(',').map(|p| Value::String(p.trim().to_string())).collect(),
        other => vec![other.clone()],
    }
}

fn contains(haystack: Option<&Value>, needle: &Value) -> bool {
    match haystack {
        Some(Value::String(s)) => s.contains(as_text(needle).as_str()),
        Some(Value::Array(items)) => items.iter().any(|item| loose_eq(item, needle)),
        Some(Value::Object(map)) => map.contains_key(&as_text(needle)),
        _ => false,
    }
}

fn lookup<'a>(variables: &'a Value, field: &str) -> Option<&'a Value> {
    get_path(variables, field).or_else(|| get_path(variables, &format!("session.{}", field)))
}

impl Rule {
    pub fn evaluate(&self, variables: &Value) -> Result<bool, EngineError> {
        let actual = lookup(variables, &self.field);

        let outcome = match self.operator {
            Operator::Equals => actual.is_some_and(|a| loose_eq(a, &self.value)),
            Operator::NotEquals => !actual.is_some_and(|a| loose_eq(a, &self.value)),
            Operator::Contains => contains(actual, &self.value),
            Operator::NotContains => !contains(actual, &self.value),
            Operator::GreaterThan
            | Operator::LessThan
            | Operator::GreaterThanOrEqual
            | Operator::LessThanOrEqual => {
                let expected = expected_number(self)?;
                match actual.and_then(as_number) {
                    Some(a) => match self.operator {
                        Operator::GreaterThan => a > expected,
                        Operator::LessThan => a < expected,
                        Operator::GreaterThanOrEqual => a >= expected,
                        _ => a <= expected,
                    },
                    None => false,
                }
            }
            Operator::In => actual.is_some_and(|a| candidates(&self.value).iter().any(|c| loose_eq(a, c))),
            Operator::NotIn => {
                !actual.is_some_and(|a| candidates(&self.value).iter().any(|c| loose_eq(a, c)))
            }
            Operator::IsEmpty => is_empty(actual),
            Operator::IsNotEmpty => !is_empty(actual),
            Operator::LengthGreaterThan => length(actual) as f64 > expected_number(self)?,
            Operator::LengthLessThan => (length(actual) as f64) < expected_number(self)?,
            Operator::LengthEquals => length(actual) as f64 == expected_number(self)?,
            Operator::BeginsWith => {
                actual.is_some_and(|a| as_text(a).starts_with(as_text(&self.value).as_str()))
            }
            Operator::EndsWith => {
                actual.is_some_and(|a| as_text(a).ends_with(as_text(&self.value).as_str()))
            }
            Operator::Matches => {
                let pattern = Regex::new(&as_text(&self.value))
                    .map_err(|e| malformed(format!("invalid pattern on '{}': {}", self.field, e)))?;
                actual.is_some_and(|a| pattern.is_match(&as_text(a)))
            }
        };

        Ok(outcome)
    }
}

impl RuleGroup {
    /// Parse a condition; `null` is the empty (always true) group
    pub fn from_condition(condition: &Value) -> Result<Self, EngineError> {
        if condition.is_null() {
            return Ok(Self {
                condition: Combinator::And,
                rules: Vec::new(),
            });
        }
        serde_json::from_value(condition.clone())
            .map_err(|e| malformed(format!("malformed condition: {}", e)))
    }

    pub fn evaluate(&self, variables: &Value) -> Result<bool, EngineError> {
        // Every rule is evaluated so malformed rules fail regardless of short-circuiting
        let mut results = Vec::with_capacity(self.rules.len());
        for node in &self.rules {
            results.push(match node {
                RuleNode::Group(group) => group.evaluate(variables)?,
                RuleNode::Rule(rule) => rule.evaluate(variables)?,
            });
        }

        Ok(match self.condition {
            Combinator::And => results.iter().all(|r| *r),
            Combinator::Or => results.is_empty() || results.iter().any(|r| *r),
        })
    }
}

/// Built-in boolean preset mapping its predicate to `"true"` / `"false"`
#[derive(Debug, Clone, Copy, Default)]
pub struct IfPreset;

impl Preset for IfPreset {
    fn kind(&self) -> &str {
        "if"
    }

    fn evaluate(&self, ctx: &PresetContext<'_>) -> Result<String, EngineError> {
        let group = RuleGroup::from_condition(ctx.condition)?;
        let label = if group.evaluate(ctx.variables)? {
            labels::TRUE
        } else {
            labels::FALSE
        };
        Ok(label.to_string())
    }
}
