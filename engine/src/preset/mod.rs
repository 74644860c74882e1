//! Preset evaluators
//!
//! Conditional steps name a preset type and carry a preset-specific
//! condition. The session machine looks the type up in a
//! [`PresetRegistry`] and calls [`Preset::evaluate`], which returns the
//! label of the connection to follow. The machine knows nothing else about
//! presets, so new kinds only need registering.
//!
//! Built-in presets:
//! - `if` ([`conditional::IfPreset`]): rule-group predicate, labels `"true"`/`"false"`
//! - `switch` ([`switch::SwitchPreset`]): value of a field, or `"default"`

pub mod conditional;
pub mod switch;

use sdk::errors::EngineError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use conditional::IfPreset;
pub use switch::SwitchPreset;

/// Inputs to a preset evaluation
#[derive(Debug, Clone, Copy)]
pub struct PresetContext<'a> {
    /// Transition context (`session`, `bot`, `message`, ...)
    pub variables: &'a Value,
    /// The step's configured condition
    pub condition: &'a Value,
}

impl<'a> PresetContext<'a> {
    pub fn new(variables: &'a Value, condition: &'a Value) -> Self {
        Self {
            variables,
            condition,
        }
    }
}

/// A conditional-branch evaluator
pub trait Preset: Send + Sync {
    /// Type name steps use to refer to this preset
    fn kind(&self) -> &str;

    /// Evaluate the condition and return an outcome label.
    ///
    /// # Errors
    ///
    /// `EngineError::PresetEvaluation` for malformed conditions.
    fn evaluate(&self, ctx: &PresetContext<'_>) -> Result<String, EngineError>;
}

/// Runtime registry of presets keyed by type name
#[derive(Clone, Default)]
pub struct PresetRegistry {
    presets: HashMap<String, Arc<dyn Preset>>,
}

impl PresetRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in presets
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IfPreset));
        registry.register(Arc::new(SwitchPreset));
        registry
    }

    /// Register a preset, replacing any previous one of the same kind
    pub fn register(&mut self, preset: Arc<dyn Preset>) {
        self.presets.insert(preset.kind().to_string(), preset);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.presets.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Evaluate the preset registered under `kind`
    pub fn evaluate(&self, kind: &str, ctx: &PresetContext<'_>) -> Result<String, EngineError> {
        let preset = self
            .presets
            .get(kind)
            .ok_or_else(|| EngineError::UnknownPreset(kind.to_string()))?;
        let label = preset.evaluate(ctx)?;
        tracing::debug!(preset = kind, label = %label, "Preset evaluated");
        Ok(label)
    }
}

impl std::fmt::Debug for PresetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresetRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
