//! Ordered per-key work queues
//!
//! Items pushed for one key are handled one at a time, in push order, by a
//! single consumer task. Different keys run concurrently. A consumer exits
//! after sitting idle and the next push for its key starts a new one.
//!
//! [`SessionQueues`] puts the session machine behind one queue per
//! [`SessionKey`], so every event source (stdin ingress, emitter fires)
//! reaches a session in the order it was submitted.

use super::{FlowEvent, SessionMachine, TransitionOutcome};
use sdk::errors::EngineError;
use sdk::types::SessionKey;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

/// How long a consumer waits for more work before exiting
pub const LANE_IDLE: Duration = Duration::from_secs(30);

type Lanes<K, T> = Arc<Mutex<HashMap<K, mpsc::UnboundedSender<T>>>>;

/// One FIFO lane per key
pub struct KeyedQueue<K, T> {
    lanes: Lanes<K, T>,
    idle: Duration,
}

impl<K, T> KeyedQueue<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new(idle: Duration) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            idle,
        }
    }

    /// Queue `item` behind everything already pushed for `key`.
    ///
    /// `handler` is only used when this push has to start the key's
    /// consumer; a running consumer keeps the handler it started with.
    pub async fn push<F, Fut>(&self, key: K, item: T, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Sends happen under the table lock, and a consumer only leaves the
        // table under it, so no item is stranded in a closing lane.
        let mut lanes = self.lanes.lock().await;
        let item = match lanes.get(&key) {
            Some(lane) => match lane.send(item) {
                Ok(()) => return,
                // Consumer gone (its handler panicked); start a new one
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        lanes.insert(key.clone(), tx);
        tokio::spawn(Self::consume(
            Arc::clone(&self.lanes),
            key,
            item,
            rx,
            handler,
            self.idle,
        ));
    }

    /// Keys with a live consumer
    pub async fn active(&self) -> usize {
        self.lanes.lock().await.len()
    }

    async fn consume<F, Fut>(
        lanes: Lanes<K, T>,
        key: K,
        first: T,
        mut rx: mpsc::UnboundedReceiver<T>,
        handler: F,
        idle: Duration,
    ) where
        F: Fn(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut next = Some(first);
        while let Some(item) = next.take() {
            handler(item).await;

            next = match tokio::time::timeout(idle, rx.recv()).await {
                Ok(item) => item,
                Err(_) => {
                    let mut lanes = lanes.lock().await;
                    match rx.try_recv() {
                        Ok(item) => Some(item),
                        Err(_) => {
                            lanes.remove(&key);
                            None
                        }
                    }
                }
            };
        }
    }
}

impl<K, T> std::fmt::Debug for KeyedQueue<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedQueue")
            .field("idle", &self.idle)
            .finish()
    }
}

type Reply = oneshot::Sender<Result<TransitionOutcome, EngineError>>;

struct Queued {
    event: FlowEvent,
    reply: Option<Reply>,
}

/// Session machine behind one ordered queue per session
pub struct SessionQueues {
    machine: Arc<SessionMachine>,
    queue: KeyedQueue<SessionKey, Queued>,
}

impl SessionQueues {
    pub fn new(machine: Arc<SessionMachine>) -> Self {
        Self::with_idle(machine, LANE_IDLE)
    }

    pub fn with_idle(machine: Arc<SessionMachine>, idle: Duration) -> Self {
        Self {
            machine,
            queue: KeyedQueue::new(idle),
        }
    }

    /// Queue an event without waiting for its transition.
    ///
    /// Failures are logged here and published by the machine.
    pub async fn submit(&self, event: FlowEvent) {
        self.push(event, None).await;
    }

    /// Queue an event and wait for its transition
    ///
    /// # Errors
    ///
    /// The transition's own error, or `QueueClosed` if the session's
    /// consumer stopped before handling the event.
    pub async fn dispatch(&self, event: FlowEvent) -> Result<TransitionOutcome, EngineError> {
        let key = event.key();
        let (tx, rx) = oneshot::channel();
        self.push(event, Some(tx)).await;
        rx.await
            .map_err(|_| EngineError::QueueClosed(key.to_string()))?
    }

    /// Sessions with a live consumer
    pub async fn active(&self) -> usize {
        self.queue.active().await
    }

    async fn push(&self, event: FlowEvent, reply: Option<Reply>) {
        let key = event.key();
        let machine = Arc::clone(&self.machine);
        let handler = move |queued: Queued| {
            let machine = Arc::clone(&machine);
            async move {
                let key = queued.event.key();
                let result = machine.handle(queued.event).await;
                match queued.reply {
                    Some(reply) => {
                        if reply.send(result).is_err() {
                            tracing::debug!(session = %key, "Caller stopped waiting for transition");
                        }
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(session = %key, error = %e, "Queued event failed");
                        }
                    }
                }
            }
        };
        self.queue.push(key, Queued { event, reply }, handler).await;
    }
}

impl std::fmt::Debug for SessionQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionQueues")
            .field("queue", &self.queue)
            .finish()
    }
}
