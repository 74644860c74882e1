//! Message bus for outbound notifications
//!
//! Step execution produces notifications (bot replies, mirrored inbound
//! channel messages) and lifecycle events (transitions, emitter fires).
//! The engine publishes them here; delivery transports subscribe by
//! [`EventType`]. Publishing never waits: a full or closed subscriber
//! channel drops the event for that subscriber only.

use sdk::types::{EmitterId, SessionKey, StepId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// Inbound message received on a channel
    ChannelMessage,
    /// Reply produced by a step for a subscriber
    BotMessage,
    /// A session advanced (or halted) successfully
    TransitionCompleted,
    /// A transition failed and the session stayed put
    TransitionFailed,
    /// An emitter fire was turned into flow-entry events
    EmitterFired,
    /// Engine runtime started
    EngineStarted,
    /// Engine runtime is stopping
    EngineStopping,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone)]
pub enum Event {
    ChannelMessage {
        session: SessionKey,
        payload: serde_json::Value,
    },
    BotMessage {
        session: SessionKey,
        step: StepId,
        payload: serde_json::Value,
    },
    TransitionCompleted {
        session: SessionKey,
        from: StepId,
        to: StepId,
    },
    TransitionFailed {
        session: SessionKey,
        step: Option<StepId>,
        error: String,
    },
    EmitterFired {
        emitter: EmitterId,
        job_id: String,
        sessions: usize,
        failures: usize,
    },
    EngineStarted,
    EngineStopping,
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::ChannelMessage { .. } => EventType::ChannelMessage,
            Event::BotMessage { .. } => EventType::BotMessage,
            Event::TransitionCompleted { .. } => EventType::TransitionCompleted,
            Event::TransitionFailed { .. } => EventType::TransitionFailed,
            Event::EmitterFired { .. } => EventType::EmitterFired,
            Event::EngineStarted => EventType::EngineStarted,
            Event::EngineStopping => EventType::EngineStopping,
        }
    }
}

/// Message bus for pub/sub delivery of engine events
///
/// Each subscriber gets its own bounded channel. Subscribers whose receiver
/// was dropped are pruned on the next publish.
pub struct MessageBus {
    channels: Arc<std::sync::Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to all matching subscribers without waiting.
    ///
    /// Returns how many subscribers accepted the event.
    pub fn publish(&self, event: Event) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let event_type = event.event_type();
        let mut delivered = 0;

        for key in [event_type, EventType::All] {
            let Some(subscribers) = channels.get_mut(&key) else {
                continue;
            };
            subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(event = ?event_type, "Subscriber channel full; event dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }

        delivered
    }

    /// Number of live subscribers for an event type
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(&event_type)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
