//! Step graph
//!
//! A bot's conversation is a directed graph of [`Step`]s joined by
//! [`Connection`]s. Graphs may contain cycles, so [`StepGraph`] is an arena:
//! steps and connections live in flat vectors and refer to each other only
//! through `StepId` keys resolved via an index map.
//!
//! A `StepGraph` is built fresh for every transition from the persistence
//! collaborator and dropped when the transition ends.
//!
//! # Invariants
//!
//! Enforced by [`StepGraph::build`]:
//! - Every connection's source and target belong to this bot's steps
//! - Labels on one step's outgoing connections are unique
//! - Every non-terminal step has at least one outgoing connection
//!
//! Enforced by [`StepGraph::with_global_connections`]:
//! - Global connections target this bot's steps and carry unique labels

pub mod definition;

use crate::request::RequestSpec;
use sdk::errors::EngineError;
use sdk::labels;
use sdk::types::{BotId, ConnectionId, StepId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// Behavior of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Sends its payload and waits for the subscriber's next message
    Message,

    /// Evaluates a preset and follows the connection labelled with the outcome
    Conditional {
        preset: String,
        #[serde(default)]
        condition: serde_json::Value,
    },

    /// Performs an outbound HTTP call
    Request(RequestSpec),

    /// Routes to its single outgoing connection without a visible reply
    Proxy,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Message => "message",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Request(_) => "request",
            StepKind::Proxy => "proxy",
        }
    }

    /// Whether the step runs as soon as it is entered instead of waiting for input
    pub fn is_automatic(&self) -> bool {
        !matches!(self, StepKind::Message)
    }
}

/// Editor canvas position; no execution meaning
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node of a bot's conversation graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub bot_id: BotId,
    pub name: String,
    pub kind: StepKind,

    /// Execution timeout, applied to request steps
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Payload sent to the subscriber when the step is entered
    #[serde(default)]
    pub message: Option<serde_json::Value>,

    /// `source path -> session variable path` captures
    #[serde(default)]
    pub save: BTreeMap<String, String>,

    /// Explicit dead end; allowed to have no outgoing connections
    #[serde(default)]
    pub terminal: bool,

    #[serde(default)]
    pub position: Option<Position>,
}

impl Step {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, StepKind::Proxy)
    }
}

/// A directed edge between two steps of the same bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source: StepId,
    pub target: StepId,
    #[serde(default)]
    pub label: Option<String>,
    /// Position among the source step's outgoing connections
    #[serde(default)]
    pub order: i32,
}

impl Connection {
    pub fn has_label(&self, label: &str) -> bool {
        self.label.as_deref() == Some(label)
    }
}

/// Bot-level connection taken from any step when an inbound message
/// matches its label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConnection {
    pub label: String,
    pub target: StepId,
}

/// Arena view of one bot's steps and connections
#[derive(Debug, Clone)]
pub struct StepGraph {
    bot_id: BotId,
    start_step: Option<StepId>,
    steps: Vec<Step>,
    index: HashMap<StepId, usize>,
    connections: Vec<Connection>,
    outgoing: HashMap<StepId, Vec<usize>>,
    globals: Vec<GlobalConnection>,
}

impl StepGraph {
    /// Build and validate a graph.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidGraph` when any invariant listed in the
    /// module docs is violated.
    pub fn build(
        bot_id: BotId,
        start_step: Option<StepId>,
        steps: Vec<Step>,
        mut connections: Vec<Connection>,
    ) -> Result<Self, EngineError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.bot_id != bot_id {
                return Err(EngineError::InvalidGraph(format!(
                    "step {} belongs to another bot",
                    step.id
                )));
            }
            if index.insert(step.id, i).is_some() {
                return Err(EngineError::InvalidGraph(format!(
                    "duplicate step {}",
                    step.id
                )));
            }
        }

        if let Some(start) = start_step {
            if !index.contains_key(&start) {
                return Err(EngineError::InvalidGraph(format!(
                    "start step {} is not part of the bot",
                    start
                )));
            }
        }

        connections.sort_by_key(|c| (c.order, c.id));

        let mut outgoing: HashMap<StepId, Vec<usize>> = HashMap::new();
        let mut seen_labels: HashSet<(StepId, &str)> = HashSet::new();
        for (i, conn) in connections.iter().enumerate() {
            if !index.contains_key(&conn.source) || !index.contains_key(&conn.target) {
                return Err(EngineError::InvalidGraph(format!(
                    "connection {} points outside the bot",
                    conn.id
                )));
            }
            if let Some(label) = conn.label.as_deref() {
                if !seen_labels.insert((conn.source, label)) {
                    return Err(EngineError::InvalidGraph(format!(
                        "step {} has two connections labelled '{}'",
                        conn.source, label
                    )));
                }
            }
            outgoing.entry(conn.source).or_default().push(i);
        }

        for step in &steps {
            if !step.terminal && !outgoing.contains_key(&step.id) {
                return Err(EngineError::InvalidGraph(format!(
                    "step '{}' has no outgoing connection and is not terminal",
                    step.name
                )));
            }
        }

        Ok(Self {
            bot_id,
            start_step,
            steps,
            index,
            connections,
            outgoing,
            globals: Vec::new(),
        })
    }

    /// Attach the bot's global connections.
    ///
    /// # Errors
    ///
    /// `InvalidGraph` when a target is not one of the bot's steps or two
    /// global connections share a label.
    pub fn with_global_connections(
        mut self,
        globals: Vec<GlobalConnection>,
    ) -> Result<Self, EngineError> {
        let mut seen = HashSet::new();
        for global in &globals {
            if !self.index.contains_key(&global.target) {
                return Err(EngineError::InvalidGraph(format!(
                    "global connection '{}' points outside the bot",
                    global.label
                )));
            }
            if !seen.insert(global.label.to_ascii_lowercase()) {
                return Err(EngineError::InvalidGraph(format!(
                    "two global connections labelled '{}'",
                    global.label
                )));
            }
        }
        self.globals = globals;
        Ok(self)
    }

    pub fn global_connections(&self) -> &[GlobalConnection] {
        &self.globals
    }

    /// Global connection whose label matches the message text, compared
    /// like button labels
    pub fn select_global(&self, text: Option<&str>) -> Option<&GlobalConnection> {
        let text = text.map(str::trim).filter(|t| !t.is_empty())?;
        self.globals
            .iter()
            .find(|g| g.label.eq_ignore_ascii_case(text))
    }

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    pub fn start_step(&self) -> Option<StepId> {
        self.start_step
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.index.contains_key(&id)
    }

    /// Look up a step
    pub fn step(&self, id: StepId) -> Result<&Step, EngineError> {
        self.index
            .get(&id)
            .map(|&i| &self.steps[i])
            .ok_or_else(|| EngineError::StepNotFound(id.to_string()))
    }

    /// Outgoing connections of a step, in order
    pub fn outgoing(&self, id: StepId) -> Vec<&Connection> {
        self.outgoing
            .get(&id)
            .map(|idx| idx.iter().map(|&i| &self.connections[i]).collect())
            .unwrap_or_default()
    }

    /// Resolve the connection of `id` carrying `label`.
    ///
    /// `Ok(None)` is the "no matching connection" outcome, which callers
    /// treat as a silent halt.
    pub fn resolve(&self, id: StepId, label: &str) -> Result<Option<&Connection>, EngineError> {
        self.step(id)?;
        Ok(self.outgoing(id).into_iter().find(|c| c.has_label(label)))
    }

    /// The single onward connection of a step, ignoring its `"error"` branch.
    ///
    /// # Errors
    ///
    /// `AmbiguousConnection` when more than one candidate remains.
    pub fn single_onward(&self, id: StepId) -> Result<Option<&Connection>, EngineError> {
        let candidates: Vec<&Connection> = self
            .outgoing(id)
            .into_iter()
            .filter(|c| !c.has_label(labels::ERROR))
            .collect();

        match candidates.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only)),
            _ => Err(EngineError::AmbiguousConnection(id.to_string())),
        }
    }

    /// Connection selected by an inbound message at a waiting step.
    ///
    /// A single connection is always taken. With several, the one whose
    /// label matches the message text wins; otherwise a lone unlabelled
    /// connection is the fallback. Several unlabelled connections and no
    /// label match is ambiguous.
    pub fn select_for_input(
        &self,
        id: StepId,
        text: Option<&str>,
    ) -> Result<Option<&Connection>, EngineError> {
        let outgoing = self.outgoing(id);
        if outgoing.len() <= 1 {
            return Ok(outgoing.into_iter().next());
        }

        if let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(hit) = outgoing.iter().find(|c| {
                c.label
                    .as_deref()
                    .is_some_and(|label| label.eq_ignore_ascii_case(text))
            }) {
                return Ok(Some(hit));
            }
        }

        let unlabelled: Vec<&Connection> = outgoing
            .into_iter()
            .filter(|c| c.label.is_none())
            .collect();
        match unlabelled.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only)),
            _ => Err(EngineError::AmbiguousConnection(id.to_string())),
        }
    }
}
