//! Flow definition files
//!
//! A bot, its steps and connections, and its emitters can be declared in
//! TOML and imported into any store. Entities are named by short keys in
//! the file; their UUIDs are derived from the bot id and the key, so
//! re-importing an edited file updates rows in place.
//!
//! ```toml
//! [bot]
//! name = "onboarding"
//! start = "ask-name"
//!
//! [[steps]]
//! key = "ask-name"
//! kind = "message"
//! message = { text = "What is your name?" }
//! save = { "message.text" = "name" }
//!
//! [[steps]]
//! key = "confirm"
//! kind = "conditional"
//! preset = "if"
//! condition = { rules = [{ field = "name", operator = "length_greater_than", value = 0 }] }
//!
//! [[steps]]
//! key = "welcome"
//! kind = "message"
//! terminal = true
//! message = { text = "Welcome, {$session.name$}!" }
//!
//! [[connections]]
//! from = "ask-name"
//! to = "confirm"
//!
//! [[connections]]
//! from = "confirm"
//! to = "welcome"
//! label = "true"
//!
//! [[connections]]
//! from = "confirm"
//! to = "ask-name"
//! label = "false"
//!
//! # Typing "restart" at any step jumps back to the first question
//! [[global_connections]]
//! label = "restart"
//! to = "ask-name"
//! ```

use super::{Connection, GlobalConnection, Step, StepGraph, StepKind};
use crate::scheduler::{Emitter, EmitterAudience, RecurrenceSpec};
use crate::store::{empty_object, BotRecord, EmitterStore, GraphStore};
use sdk::errors::EngineError;
use sdk::types::{BotId, ConnectionId, EmitterId, RecurrenceId, StepId};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

/// Namespace for bot ids derived from bot names
const BOT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a57_93d4_4e0b_b8a1_5c3e_7d90_2f46);

fn default_true() -> bool {
    true
}

fn default_audience() -> EmitterAudience {
    EmitterAudience::Broadcast
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotDef {
    pub name: String,
    #[serde(default)]
    pub id: Option<BotId>,
    /// Key of the start step
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default = "empty_object")]
    pub variables: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDef {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub save: BTreeMap<String, String>,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDef {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub order: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConnectionDef {
    pub label: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurrenceDef {
    pub key: String,
    #[serde(flatten)]
    pub spec: RecurrenceSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitterDef {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    /// External job id; `<bot name>:<key>` when unset
    #[serde(default)]
    pub job_id: Option<String>,
    /// Key of the target step
    #[serde(default)]
    pub target: Option<String>,
    /// Key of a recurrence
    #[serde(default)]
    pub recurrence: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default = "default_true")]
    pub needs_message_processing: bool,
    #[serde(default = "default_audience")]
    pub audience: EmitterAudience,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Parsed flow definition file
#[derive(Debug, Clone, Deserialize)]
pub struct FlowDefinition {
    pub bot: BotDef,
    #[serde(default)]
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub connections: Vec<ConnectionDef>,
    #[serde(default)]
    pub global_connections: Vec<GlobalConnectionDef>,
    #[serde(default)]
    pub recurrences: Vec<RecurrenceDef>,
    #[serde(default)]
    pub emitters: Vec<EmitterDef>,
}

/// A definition resolved to engine entities
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub bot: BotRecord,
    pub steps: Vec<Step>,
    pub connections: Vec<Connection>,
    pub recurrences: Vec<RecurrenceSpec>,
    pub emitters: Vec<Emitter>,
}

impl CompiledFlow {
    /// Step id for a key of the definition
    pub fn step_id(&self, key: &str) -> StepId {
        StepId::derived(self.bot.id.as_uuid(), key)
    }
}

fn invalid(message: String) -> EngineError {
    EngineError::InvalidGraph(message)
}

impl FlowDefinition {
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        toml::from_str(contents)
            .map_err(|e| invalid(format!("failed to parse flow definition: {}", e)))
    }

    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn bot_id(&self) -> BotId {
        self.bot
            .id
            .unwrap_or_else(|| BotId::derived(&BOT_NAMESPACE, &self.bot.name))
    }

    /// Resolve keys to ids and validate the graph.
    ///
    /// # Errors
    ///
    /// `InvalidGraph` for duplicate or unknown keys and for any step graph
    /// invariant violation.
    pub fn compile(&self) -> Result<CompiledFlow, EngineError> {
        let bot_id = self.bot_id();
        let ns = *bot_id.as_uuid();

        let mut step_ids: HashMap<&str, StepId> = HashMap::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for def in &self.steps {
            let id = StepId::derived(&ns, &def.key);
            if step_ids.insert(def.key.as_str(), id).is_some() {
                return Err(invalid(format!("duplicate step key '{}'", def.key)));
            }
            steps.push(Step {
                id,
                bot_id,
                name: def.name.clone().unwrap_or_else(|| def.key.clone()),
                kind: def.kind.clone(),
                timeout_secs: def.timeout_secs,
                message: def.message.clone(),
                save: def.save.clone(),
                terminal: def.terminal,
                position: None,
            });
        }

        let lookup = |key: &str, what: &str| {
            step_ids
                .get(key)
                .copied()
                .ok_or_else(|| invalid(format!("{} refers to unknown step '{}'", what, key)))
        };

        let mut per_source: HashMap<&str, i32> = HashMap::new();
        let mut connections = Vec::with_capacity(self.connections.len());
        for def in &self.connections {
            let source = lookup(&def.from, "connection")?;
            let target = lookup(&def.to, "connection")?;
            let index = per_source.entry(def.from.as_str()).or_insert(0);
            connections.push(Connection {
                id: ConnectionId::derived(&ns, &format!("{}#{}", def.from, index)),
                source,
                target,
                label: def.label.clone(),
                order: def.order.unwrap_or(*index),
            });
            *index += 1;
        }

        let start_step = match &self.bot.start {
            Some(key) => Some(lookup(key, "bot start")?),
            None => None,
        };

        let global_connections = self
            .global_connections
            .iter()
            .map(|def| {
                Ok(GlobalConnection {
                    label: def.label.clone(),
                    target: lookup(&def.to, "global connection")?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        // Validate before anything is written
        StepGraph::build(bot_id, start_step, steps.clone(), connections.clone())?
            .with_global_connections(global_connections.clone())?;

        let mut recurrence_ids: HashMap<&str, RecurrenceId> = HashMap::new();
        let mut recurrences = Vec::with_capacity(self.recurrences.len());
        for def in &self.recurrences {
            let id = RecurrenceId::derived(&ns, &def.key);
            if recurrence_ids.insert(def.key.as_str(), id).is_some() {
                return Err(invalid(format!("duplicate recurrence key '{}'", def.key)));
            }
            recurrences.push(RecurrenceSpec {
                id,
                ..def.spec.clone()
            });
        }

        let mut emitter_keys = HashSet::new();
        let mut emitters = Vec::with_capacity(self.emitters.len());
        for def in &self.emitters {
            if !emitter_keys.insert(def.key.as_str()) {
                return Err(invalid(format!("duplicate emitter key '{}'", def.key)));
            }
            let target_step = match &def.target {
                Some(key) => Some(lookup(key, "emitter")?),
                None => None,
            };
            let recurrence = match &def.recurrence {
                Some(key) => Some(recurrence_ids.get(key.as_str()).copied().ok_or_else(|| {
                    invalid(format!("emitter '{}' refers to unknown recurrence '{}'", def.key, key))
                })?),
                None => None,
            };
            emitters.push(Emitter {
                id: EmitterId::derived(&ns, &def.key),
                bot_id,
                name: def.name.clone().unwrap_or_else(|| def.key.clone()),
                target_step,
                job_id: def
                    .job_id
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", self.bot.name, def.key)),
                recurrence,
                message: def.message.clone(),
                needs_message_processing: def.needs_message_processing,
                audience: def.audience.clone(),
                is_active: def.active,
            });
        }

        Ok(CompiledFlow {
            bot: BotRecord {
                id: bot_id,
                name: self.bot.name.clone(),
                start_step,
                variables: self.bot.variables.clone(),
                global_connections,
            },
            steps,
            connections,
            recurrences,
            emitters,
        })
    }

    /// Compile and write the flow into the stores.
    ///
    /// Steps and connections of a previous import that are no longer
    /// declared are removed.
    pub async fn import(
        &self,
        graphs: &dyn GraphStore,
        emitters: &dyn EmitterStore,
    ) -> Result<CompiledFlow, EngineError> {
        let flow = self.compile()?;

        let keep_steps: HashSet<StepId> = flow.steps.iter().map(|s| s.id).collect();
        let keep_connections: HashSet<ConnectionId> = flow.connections.iter().map(|c| c.id).collect();
        if let Ok(previous) = graphs.load_graph(flow.bot.id).await {
            for step in previous.steps() {
                for connection in previous.outgoing(step.id) {
                    if !keep_connections.contains(&connection.id) {
                        graphs.delete_connection(connection.id).await?;
                    }
                }
            }
            for step in previous.steps() {
                if !keep_steps.contains(&step.id) {
                    graphs.delete_step(step.id).await?;
                }
            }
        }

        graphs.upsert_bot(&flow.bot).await?;
        for step in &flow.steps {
            graphs.upsert_step(step).await?;
        }
        for connection in &flow.connections {
            graphs.upsert_connection(connection).await?;
        }
        for spec in &flow.recurrences {
            emitters.upsert_recurrence(spec).await?;
        }
        for emitter in &flow.emitters {
            emitters.upsert_emitter(emitter).await?;
        }

        tracing::info!(
            bot = %flow.bot.id,
            name = %flow.bot.name,
            steps = flow.steps.len(),
            connections = flow.connections.len(),
            emitters = flow.emitters.len(),
            "Flow imported"
        );
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const ONBOARDING: &str = r#"
[bot]
name = "onboarding"
start = "ask-name"

[bot.variables]
title = "Helper"

[[steps]]
key = "ask-name"
kind = "message"
message = { text = "What is your name?" }
save = { "message.text" = "name" }

[[steps]]
key = "confirm"
kind = "conditional"
preset = "if"
condition = { rules = [{ field = "name", operator = "length_greater_than", value = 0 }] }

[[steps]]
key = "lookup"
kind = "request"
url = "https://crm.test/contacts/{$session.name$}"
credential = { provider = "crm", strategy = "bearer" }
timeout_secs = 5

[[steps]]
key = "welcome"
kind = "message"
terminal = true
message = { text = "Welcome, {$session.name$}!" }

[[connections]]
from = "ask-name"
to = "confirm"

[[connections]]
from = "confirm"
to = "lookup"
label = "true"

[[connections]]
from = "confirm"
to = "ask-name"
label = "false"

[[connections]]
from = "lookup"
to = "welcome"

[[recurrences]]
key = "morning"
hour = 9
timezone = "Europe/Kyiv"
jitter_secs = 300

[[emitters]]
key = "digest"
job_id = "job-42"
target = "welcome"
recurrence = "morning"
message = { text = "Good morning" }
needs_message_processing = false

[[global_connections]]
label = "restart"
to = "ask-name"
"#;

    #[test]
    fn test_compile_resolves_keys() {
        let def = FlowDefinition::from_toml_str(ONBOARDING).unwrap();
        let flow = def.compile().unwrap();

        assert_eq!(flow.steps.len(), 4);
        assert_eq!(flow.bot.start_step, Some(flow.step_id("ask-name")));
        assert_eq!(flow.bot.variables["title"], "Helper");

        let lookup = flow.steps.iter().find(|s| s.name == "lookup").unwrap();
        match &lookup.kind {
            StepKind::Request(spec) => {
                assert_eq!(spec.credential.as_ref().unwrap().provider, "crm");
                assert_eq!(spec.method, "GET");
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(lookup.timeout_secs, Some(5));

        let emitter = &flow.emitters[0];
        assert_eq!(emitter.job_id, "job-42");
        assert_eq!(emitter.target_step, Some(flow.step_id("welcome")));
        assert_eq!(emitter.audience, EmitterAudience::Broadcast);
        assert_eq!(flow.recurrences[0].hour.as_deref(), Some("9"));
        assert_eq!(emitter.recurrence, Some(flow.recurrences[0].id));

        assert_eq!(
            flow.bot.global_connections,
            vec![GlobalConnection {
                label: "restart".to_string(),
                target: flow.step_id("ask-name"),
            }]
        );
    }

    #[test]
    fn test_global_connection_to_unknown_step_rejected() {
        let broken = ONBOARDING.replace("label = \"restart\"\nto = \"ask-name\"", "label = \"restart\"\nto = \"gone\"");
        let err = FlowDefinition::from_toml_str(&broken).unwrap().compile().unwrap_err();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_ids_are_stable() {
        let a = FlowDefinition::from_toml_str(ONBOARDING).unwrap().compile().unwrap();
        let b = FlowDefinition::from_toml_str(ONBOARDING).unwrap().compile().unwrap();
        assert_eq!(a.bot.id, b.bot.id);
        assert_eq!(a.step_id("welcome"), b.step_id("welcome"));
        assert_eq!(a.connections[0].id, b.connections[0].id);
    }

    #[test]
    fn test_unknown_step_key_rejected() {
        let broken = ONBOARDING.replace("to = \"welcome\"\n\n[[recurrences]]", "to = \"nowhere\"\n\n[[recurrences]]");
        let err = FlowDefinition::from_toml_str(&broken).unwrap().compile().unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_graph_invariants_checked() {
        let dead_end = r#"
[bot]
name = "broken"

[[steps]]
key = "a"
kind = "proxy"
"#;
        let def = FlowDefinition::from_toml_str(dead_end).unwrap();
        assert!(matches!(def.compile(), Err(EngineError::InvalidGraph(_))));
    }

    #[tokio::test]
    async fn test_import_and_reimport() {
        let store = MemoryStore::new();
        let def = FlowDefinition::from_toml_str(ONBOARDING).unwrap();
        let flow = def.import(&store, &store).await.unwrap();

        let graph = store.load_graph(flow.bot.id).await.unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.global_connections().len(), 1);
        assert!(store.emitter_by_job("job-42").await.unwrap().is_some());

        // Drop the request step and route straight to welcome
        let trimmed = ONBOARDING
            .replace(
                "[[steps]]\nkey = \"lookup\"\nkind = \"request\"\nurl = \"https://crm.test/contacts/{$session.name$}\"\ncredential = { provider = \"crm\", strategy = \"bearer\" }\ntimeout_secs = 5\n",
                "",
            )
            .replace("to = \"lookup\"", "to = \"welcome\"")
            .replace("[[connections]]\nfrom = \"lookup\"\nto = \"welcome\"\n", "");
        let def = FlowDefinition::from_toml_str(&trimmed).unwrap();
        def.import(&store, &store).await.unwrap();

        let graph = store.load_graph(flow.bot.id).await.unwrap();
        assert_eq!(graph.len(), 3);
        assert!(graph.steps().all(|s| s.name != "lookup"));
    }
}
