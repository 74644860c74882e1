//! Session State Machine
//!
//! Every (subscriber, bot, channel) triple has one session pointing at its
//! current step. [`SessionMachine::handle`] advances a session for one
//! inbound event:
//!
//! 1. Acquire the session's lock ([`SessionLocks`])
//! 2. Load the bot's graph and the session (creating it on first contact)
//! 3. Execute steps until one waits for input or the flow halts
//! 4. Commit the new step pointer and variables together, then publish
//!    the buffered notifications
//!
//! Nothing is written and nothing is published until step 4, so a failed
//! transition leaves the session exactly where it was.
//!
//! Event sources go through [`SessionQueues`], which hands each session its
//! events one at a time in submission order.
//!
//! # Step execution
//!
//! Entering a step sends its message payload unless it is a proxy step.
//! Message steps then wait for the next inbound event. Conditional, request
//! and proxy steps run immediately and count as hops; a transition that
//! exceeds the configured hop limit fails with `HopLimitExceeded`.
//!
//! An inbound message whose text matches one of the bot's global
//! connections jumps to that connection's target from any step, before the
//! current step's save mappings or connections are considered.

pub mod locks;
pub mod queue;

pub use locks::SessionLocks;
pub use queue::{KeyedQueue, SessionQueues};

use crate::config::EngineConfig;
use crate::graph::{StepGraph, StepKind};
use crate::message_bus::{Event, MessageBus};
use crate::preset::{PresetContext, PresetRegistry};
use crate::request::RequestExecutor;
use crate::store::{GraphStore, SessionRecord, SessionStore};
use crate::template::render_value;
use crate::variables::{apply_mappings, set_path};
use chrono::Utc;
use sdk::errors::EngineError;
use sdk::labels;
use sdk::types::{EmitterId, SessionKey, StepId};
use serde_json::{json, Value};
use std::sync::Arc;

/// Session machine settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_hops: usize,
    pub start_step_reentry: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_hops: 64,
            start_step_reentry: true,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_hops: config.max_hops_per_transition,
            start_step_reentry: config.start_step_reentry,
        }
    }
}

/// An event that advances one session
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Live inbound message from a subscriber
    Message { key: SessionKey, payload: Value },

    /// Synthetic entry at `target`, produced by an emitter fire
    Injected {
        key: SessionKey,
        target: StepId,
        /// Emitter payload, sent before the target step is entered
        payload: Option<Value>,
        /// Substitute `{$...$}` placeholders in `payload` against the session
        substitute: bool,
        emitter: EmitterId,
    },
}

impl FlowEvent {
    /// A text message event
    pub fn text(key: SessionKey, text: impl Into<String>) -> Self {
        FlowEvent::Message {
            key,
            payload: json!({ "text": text.into() }),
        }
    }

    pub fn key(&self) -> SessionKey {
        match self {
            FlowEvent::Message { key, .. } | FlowEvent::Injected { key, .. } => *key,
        }
    }
}

/// Why a transition stopped where it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Stopped at a message step waiting for input
    AwaitingInput,
    /// Reached a step with no onward connection
    DeadEnd,
    /// An outcome label or the message text matched no connection
    NoMatchingConnection,
}

/// Result of a committed transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub session: SessionKey,
    pub from: StepId,
    pub to: StepId,
    pub halt: HaltReason,
    /// Bot messages published by the transition
    pub notifications: usize,
    /// Automatic steps executed
    pub hops: usize,
}

/// Working state of one transition; discarded on failure
struct Transition<'g> {
    graph: &'g StepGraph,
    key: SessionKey,
    bot_variables: Value,
    variables: Value,
    message: Value,
    outbox: Vec<(StepId, Value)>,
    hops: usize,
}

impl Transition<'_> {
    fn context(&self) -> Value {
        json!({
            "session": self.variables,
            "bot": self.bot_variables,
            "message": self.message,
            "subscriber": { "id": self.key.subscriber },
            "channel": { "id": self.key.channel },
        })
    }

    fn notify(&mut self, step: &crate::graph::Step) {
        if step.is_proxy() {
            return;
        }
        if let Some(payload) = &step.message {
            let rendered = render_value(payload, &self.context());
            self.outbox.push((step.id, rendered));
        }
    }

    fn hop(&mut self, limit: usize) -> Result<(), EngineError> {
        self.hops += 1;
        if self.hops > limit {
            return Err(EngineError::HopLimitExceeded(limit));
        }
        Ok(())
    }
}

/// Plain-string payloads become `{"text": ...}`
fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::String(text) => json!({ "text": text }),
        other => other,
    }
}

/// Advances sessions through their bot's step graph
pub struct SessionMachine {
    graphs: Arc<dyn GraphStore>,
    sessions: Arc<dyn SessionStore>,
    presets: Arc<PresetRegistry>,
    executor: Arc<RequestExecutor>,
    bus: Arc<MessageBus>,
    locks: SessionLocks,
    settings: EngineSettings,
}

impl SessionMachine {
    pub fn new(
        graphs: Arc<dyn GraphStore>,
        sessions: Arc<dyn SessionStore>,
        presets: Arc<PresetRegistry>,
        executor: Arc<RequestExecutor>,
        bus: Arc<MessageBus>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            graphs,
            sessions,
            presets,
            executor,
            bus,
            locks: SessionLocks::new(),
            settings,
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Advance one session for one event.
    ///
    /// Concurrent calls for the same session never interleave. Callers
    /// that need submission order use [`SessionQueues`].
    ///
    /// # Errors
    ///
    /// Any error leaves the session's step and variables unchanged and is
    /// also published as `Event::TransitionFailed`.
    pub async fn handle(&self, event: FlowEvent) -> Result<TransitionOutcome, EngineError> {
        let key = event.key();
        let _guard = self.locks.acquire(key).await;

        let mut at = None;
        match self.transition(key, event, &mut at).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(session = %key, step = ?at, error = %e, "Transition failed");
                self.bus.publish(Event::TransitionFailed {
                    session: key,
                    step: at,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn transition(
        &self,
        key: SessionKey,
        event: FlowEvent,
        at: &mut Option<StepId>,
    ) -> Result<TransitionOutcome, EngineError> {
        let bot = self
            .graphs
            .bot(key.bot)
            .await?
            .ok_or_else(|| EngineError::InvalidGraph(format!("unknown bot {}", key.bot)))?;
        let graph = self.graphs.load_graph(key.bot).await?;

        let record = match self.sessions.session(key).await? {
            Some(record) => record,
            None => {
                let start = match &event {
                    FlowEvent::Message { .. } => graph.start_step().ok_or_else(|| {
                        EngineError::InvalidGraph(format!("bot '{}' has no start step", bot.name))
                    })?,
                    FlowEvent::Injected { target, .. } => *target,
                };
                graph.step(start)?;
                tracing::info!(session = %key, "Session created");
                self.sessions.get_or_create_session(key, start).await?
            }
        };

        let from = record.current_step;
        *at = Some(from);

        let mut tx = Transition {
            graph: &graph,
            key,
            bot_variables: bot.variables,
            variables: record.variables.clone(),
            message: Value::Null,
            outbox: Vec::new(),
            hops: 0,
        };

        let mut inbound = None;
        let (to, halt) = match event {
            FlowEvent::Message { payload, .. } => {
                let payload = normalize_payload(payload);
                tx.message = payload.clone();
                inbound = Some(payload);
                self.on_message(&mut tx, from).await?
            }
            FlowEvent::Injected {
                target,
                payload,
                substitute,
                emitter,
                ..
            } => {
                graph.step(target)?;
                tracing::debug!(session = %key, emitter = %emitter, target = %target, "Injected entry");
                if let Some(payload) = payload {
                    let payload = if substitute {
                        render_value(&payload, &tx.context())
                    } else {
                        payload
                    };
                    tx.outbox.push((target, payload.clone()));
                    tx.message = payload;
                }
                self.run_from(&mut tx, target, true).await?
            }
        };

        let notifications = tx.outbox.len();
        let hops = tx.hops;
        let outbox = std::mem::take(&mut tx.outbox);

        let committed = SessionRecord {
            current_step: to,
            variables: tx.variables,
            updated_at: Utc::now(),
            ..record
        };
        self.sessions.save_session(&committed).await?;

        if let Some(payload) = inbound {
            self.bus.publish(Event::ChannelMessage {
                session: key,
                payload,
            });
        }
        for (step, payload) in outbox {
            self.bus.publish(Event::BotMessage {
                session: key,
                step,
                payload,
            });
        }
        self.bus.publish(Event::TransitionCompleted {
            session: key,
            from,
            to,
        });

        tracing::debug!(session = %key, from = %from, to = %to, halt = ?halt, hops, "Transition committed");

        Ok(TransitionOutcome {
            session: key,
            from,
            to,
            halt,
            notifications,
            hops,
        })
    }

    /// Handle a live message at the session's current step
    async fn on_message(
        &self,
        tx: &mut Transition<'_>,
        current: StepId,
    ) -> Result<(StepId, HaltReason), EngineError> {
        let graph = tx.graph;
        let step = graph.step(current)?;
        let text = tx
            .message
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);

        // Bot-level connections win over the current step's own
        if let Some(global) = graph.select_global(text.as_deref()) {
            tracing::debug!(session = %tx.key, step = %step.name, label = %global.label, "Global connection matched");
            return self.run_from(tx, global.target, true).await;
        }

        let context = tx.context();
        apply_mappings(&step.save, &context, &mut tx.variables);

        if graph.outgoing(current).is_empty() {
            return match graph.start_step() {
                Some(start) if self.settings.start_step_reentry && start != current => {
                    tracing::debug!(session = %tx.key, "Dead end; re-entering at start step");
                    self.run_from(tx, start, true).await
                }
                _ => {
                    tracing::warn!(session = %tx.key, step = %step.name, "Message at dead end");
                    Ok((current, HaltReason::DeadEnd))
                }
            };
        }

        if step.kind.is_automatic() {
            // Parked on an automatic step after an earlier halt: run it again
            return self.run_from(tx, current, false).await;
        }

        match graph.select_for_input(current, text.as_deref())? {
            Some(connection) => self.run_from(tx, connection.target, true).await,
            None => {
                tracing::debug!(session = %tx.key, step = %step.name, "No connection matches input");
                Ok((current, HaltReason::NoMatchingConnection))
            }
        }
    }

    /// Enter `current` and keep executing automatic steps
    async fn run_from(
        &self,
        tx: &mut Transition<'_>,
        mut current: StepId,
        mut notify: bool,
    ) -> Result<(StepId, HaltReason), EngineError> {
        let graph = tx.graph;

        loop {
            let step = graph.step(current)?;
            if notify {
                tx.notify(step);
            }
            notify = true;

            tracing::debug!(session = %tx.key, step = %step.name, kind = step.kind.name(), "Executing step");

            let next = match &step.kind {
                StepKind::Message => return Ok((current, HaltReason::AwaitingInput)),

                StepKind::Conditional { preset, condition } => {
                    tx.hop(self.settings.max_hops)?;
                    let context = tx.context();
                    let label = self
                        .presets
                        .evaluate(preset, &PresetContext::new(&context, condition))?;
                    match graph.resolve(current, &label)? {
                        Some(connection) => connection.target,
                        None => {
                            tracing::debug!(session = %tx.key, step = %step.name, label = %label, "No connection for label");
                            return Ok((current, HaltReason::NoMatchingConnection));
                        }
                    }
                }

                StepKind::Request(spec) => {
                    tx.hop(self.settings.max_hops)?;
                    let context = tx.context();
                    match self
                        .executor
                        .execute(graph.bot_id(), spec, &context, step.timeout())
                        .await
                    {
                        Ok(response) => {
                            let response = response.to_json();
                            set_path(&mut tx.variables, spec.result_variable(), response.clone());

                            let mut context = tx.context();
                            if let Value::Object(map) = &mut context {
                                map.insert("response".to_string(), response);
                            }
                            apply_mappings(&step.save, &context, &mut tx.variables);

                            match graph.single_onward(current)? {
                                Some(connection) => connection.target,
                                None => return Ok((current, HaltReason::DeadEnd)),
                            }
                        }
                        Err(e) if e.routes_to_error_label() => {
                            match graph.resolve(current, labels::ERROR)? {
                                Some(connection) => {
                                    tracing::warn!(session = %tx.key, step = %step.name, error = %e, "Request failed; following error branch");
                                    set_path(
                                        &mut tx.variables,
                                        "last_error",
                                        json!({ "step": step.name, "error": e.to_string() }),
                                    );
                                    connection.target
                                }
                                None => return Err(e),
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }

                StepKind::Proxy => {
                    tx.hop(self.settings.max_hops)?;
                    match graph.single_onward(current)? {
                        Some(connection) => connection.target,
                        None => return Ok((current, HaltReason::DeadEnd)),
                    }
                }
            };

            current = next;
        }
    }
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("settings", &self.settings)
            .field("presets", &self.presets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_payload_is_wrapped() {
        assert_eq!(normalize_payload(json!("hi")), json!({"text": "hi"}));
        assert_eq!(normalize_payload(json!({"button": "yes"})), json!({"button": "yes"}));
    }

    #[test]
    fn test_event_key() {
        let key = SessionKey::new(
            sdk::types::SubscriberId::new(),
            sdk::types::BotId::new(),
            sdk::types::ChannelId::new(),
        );
        assert_eq!(FlowEvent::text(key, "hello").key(), key);
    }
}
