//! The `switch` preset: branch on the value of one field
//!
//! Condition shape: `{"field": "session.plan", "cases": ["free", "pro"], "default": "other"}`.
//! The field's text value is the label when it is one of `cases`;
//! otherwise the `default` label (`"default"` unless configured).

use super::{Preset, PresetContext};
use crate::variables::get_path;
use sdk::errors::EngineError;
use sdk::labels;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct SwitchCondition {
    field: String,
    #[serde(default)]
    cases: Vec<String>,
    #[serde(default)]
    default: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchPreset;

impl Preset for SwitchPreset {
    fn kind(&self) -> &str {
        "switch"
    }

    fn evaluate(&self, ctx: &PresetContext<'_>) -> Result<String, EngineError> {
        let condition: SwitchCondition = serde_json::from_value(ctx.condition.clone())
            .map_err(|e| EngineError::PresetEvaluation(format!("malformed switch: {}", e)))?;

        let value = match get_path(ctx.variables, &condition.field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        let fallback = || condition.default.clone().unwrap_or_else(|| labels::DEFAULT.to_string());
        Ok(match value {
            Some(v) if condition.cases.iter().any(|c| c == &v) => v,
            _ => fallback(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_switch_cases() {
        let cond = json!({"field": "session.plan", "cases": ["free", "pro"]});
        let pro = json!({"session": {"plan": "pro"}});
        let odd = json!({"session": {"plan": "enterprise"}});

        assert_eq!(SwitchPreset.evaluate(&PresetContext::new(&pro, &cond)).unwrap(), "pro");
        assert_eq!(SwitchPreset.evaluate(&PresetContext::new(&odd, &cond)).unwrap(), "default");
    }

    #[test]
    fn test_switch_custom_default_and_numbers() {
        let cond = json!({"field": "session.tier", "cases": ["1", "2"], "default": "other"});
        let two = json!({"session": {"tier": 2}});
        let none = json!({"session": {}});

        assert_eq!(SwitchPreset.evaluate(&PresetContext::new(&two, &cond)).unwrap(), "2");
        assert_eq!(SwitchPreset.evaluate(&PresetContext::new(&none, &cond)).unwrap(), "other");
    }

    #[test]
    fn test_switch_requires_field() {
        let cond = json!({"cases": ["a"]});
        let vars = json!({});
        assert!(SwitchPreset.evaluate(&PresetContext::new(&vars, &cond)).is_err());
    }
}
