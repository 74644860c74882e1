//! Engine assembly and the serve loop
//!
//! [`Engine::assemble`] wires the vault, request executor, preset registry,
//! session machine and emitter scheduler over a set of [`Stores`].
//! [`DaemonManager`] runs an assembled engine in the foreground:
//!
//! - a [`CronDriver`] delivers job fires, handled in order per job
//! - the emitter sync loop reconciles jobs with the emitter store
//! - inbound messages arrive as JSON lines on stdin and are queued per
//!   session in line order
//! - bot messages leave as JSON lines on stdout
//!
//! # Graceful Shutdown
//!
//! Ctrl-C or SIGTERM sets the shutdown flag. The manager then:
//! 1. Publishes `EngineStopping`
//! 2. Aborts the ingress, dispatch, sync and output tasks
//! 3. Flushes the SQLite WAL and closes the pool

use crate::config::Config;
use crate::crypto::{SecretBox, VaultKey};
use crate::db::Database;
use crate::message_bus::{Event, EventType, MessageBus};
use crate::preset::PresetRegistry;
use crate::request::RequestExecutor;
use crate::scheduler::{
    CronDriver, EmitterScheduler, FireReport, JobFire, JobScheduler, SchedulerSettings,
};
use crate::session::queue::LANE_IDLE;
use crate::session::{EngineSettings, FlowEvent, KeyedQueue, SessionMachine, SessionQueues};
use crate::store::{CredentialStore, EmitterStore, GraphStore, MemoryStore, SessionStore};
use crate::vault::CredentialVault;
use anyhow::{Context, Result};
use sdk::errors::EngineError;
use sdk::types::{BotId, ChannelId, SessionKey, SubscriberId};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

/// Buffer between the cron driver and the fire dispatcher
const FIRE_BUFFER: usize = 256;

/// Persistence collaborators, one handle per concern
#[derive(Clone)]
pub struct Stores {
    pub graphs: Arc<dyn GraphStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub emitters: Arc<dyn EmitterStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Stores {
    /// Every concern backed by one in-process store
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            graphs: Arc::clone(&store) as Arc<dyn GraphStore>,
            sessions: Arc::clone(&store) as Arc<dyn SessionStore>,
            emitters: Arc::clone(&store) as Arc<dyn EmitterStore>,
            credentials: store,
        }
    }

    /// Every concern backed by the SQLite repositories of `database`
    pub fn sqlite(database: &Database) -> Self {
        Self {
            graphs: Arc::new(database.graphs()),
            sessions: Arc::new(database.sessions()),
            emitters: Arc::new(database.emitters()),
            credentials: Arc::new(database.credentials()),
        }
    }
}

/// A fully wired engine
pub struct Engine {
    pub stores: Stores,
    pub bus: Arc<MessageBus>,
    pub vault: Arc<CredentialVault>,
    pub machine: Arc<SessionMachine>,
    pub queues: Arc<SessionQueues>,
    pub scheduler: Arc<EmitterScheduler>,
}

impl Engine {
    /// Wire every component over `stores`.
    ///
    /// # Errors
    ///
    /// Fails only when the shared HTTP client cannot be built.
    pub fn assemble(config: &Config, key: &VaultKey, stores: Stores) -> Result<Self, EngineError> {
        let secret_box = Arc::new(SecretBox::new(key));
        let vault = Arc::new(CredentialVault::new(
            Arc::clone(&stores.credentials),
            secret_box,
        ));

        let executor = Arc::new(RequestExecutor::new(
            Arc::clone(&vault),
            &config.http,
            Duration::from_secs(config.engine.default_request_timeout_secs),
        )?);

        let bus = Arc::new(MessageBus::new());
        let presets = Arc::new(PresetRegistry::with_builtins());

        let machine = Arc::new(SessionMachine::new(
            Arc::clone(&stores.graphs),
            Arc::clone(&stores.sessions),
            presets,
            executor,
            Arc::clone(&bus),
            EngineSettings::from(&config.engine),
        ));

        let queues = Arc::new(SessionQueues::new(Arc::clone(&machine)));

        let scheduler = Arc::new(EmitterScheduler::new(
            Arc::clone(&stores.emitters),
            Arc::clone(&stores.sessions),
            Arc::clone(&queues),
            Arc::clone(&bus),
            SchedulerSettings::from(&config.scheduler),
        ));

        Ok(Self {
            stores,
            bus,
            vault,
            machine,
            queues,
            scheduler,
        })
    }
}

/// One line of stdin ingress
///
/// `payload` wins over `text` when both are present.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub bot: BotId,
    pub subscriber: SubscriberId,
    pub channel: ChannelId,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl InboundMessage {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.subscriber, self.bot, self.channel)
    }

    /// The flow event for this message, if it carries any content
    pub fn into_event(self) -> Option<FlowEvent> {
        let key = self.key();
        match (self.payload, self.text) {
            (Some(payload), _) => Some(FlowEvent::Message { key, payload }),
            (None, Some(text)) => Some(FlowEvent::text(key, text)),
            (None, None) => None,
        }
    }
}

/// Runs an assembled engine until shutdown
pub struct DaemonManager {
    engine: Engine,

    /// Shutdown flag for graceful termination
    shutdown_flag: Arc<AtomicBool>,

    /// Background tasks, aborted on shutdown
    task_handles: Vec<JoinHandle<()>>,

    /// Database connection, closed on shutdown
    database: Option<Database>,
}

impl DaemonManager {
    pub fn new(engine: Engine, database: Option<Database>) -> Self {
        Self {
            engine,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            task_handles: Vec::new(),
            database,
        }
    }

    /// Spawn the dispatch, sync, ingress, output and signal tasks
    pub fn start(&mut self, config: &Config) {
        let (driver, mut fires) = CronDriver::new(FIRE_BUFFER);
        let driver: Arc<dyn JobScheduler> = Arc::new(driver);

        let scheduler = Arc::clone(&self.engine.scheduler);
        self.task_handles.push(tokio::spawn(async move {
            // Fires of one job run in delivery order
            let lanes: KeyedQueue<String, JobFire> = KeyedQueue::new(LANE_IDLE);
            while let Some(fire) = fires.recv().await {
                let scheduler = Arc::clone(&scheduler);
                lanes
                    .push(fire.job_id.clone(), fire, move |fire| {
                        let scheduler = Arc::clone(&scheduler);
                        async move { Self::handle_fire(&scheduler, fire).await }
                    })
                    .await;
            }
        }));

        let interval = Duration::from_secs(config.scheduler.sync_interval_secs);
        self.task_handles
            .push(self.engine.scheduler.spawn_sync_loop(driver, interval));

        self.task_handles.push(Self::spawn_output(&self.engine.bus));

        let queues = Arc::clone(&self.engine.queues);
        self.task_handles.push(tokio::spawn(async move {
            match run_ingress(BufReader::new(tokio::io::stdin()), &queues).await {
                Ok(lines) => tracing::info!(lines, "Stdin closed; ingress stopped"),
                Err(e) => tracing::error!(error = %e, "Failed to read stdin"),
            }
        }));
        self.task_handles
            .push(Self::setup_signal_handler(Arc::clone(&self.shutdown_flag)));

        self.engine.bus.publish(Event::EngineStarted);
        tracing::info!("Engine started");
    }

    async fn handle_fire(scheduler: &EmitterScheduler, fire: JobFire) {
        let job_id = fire.job_id.clone();
        match scheduler.on_fire(fire).await {
            Ok(FireReport::Dispatched {
                sessions, failures, ..
            }) => {
                tracing::info!(job_id = %job_id, sessions, failures, "Emitter fire handled");
            }
            Ok(report) => {
                tracing::debug!(job_id = %job_id, ?report, "Emitter fire skipped");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Emitter fire failed");
            }
        }
    }

    /// Write bot messages to stdout as JSON lines
    fn spawn_output(bus: &MessageBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe(EventType::BotMessage);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(event) = rx.recv().await {
                let Event::BotMessage {
                    session,
                    step,
                    payload,
                } = event
                else {
                    continue;
                };
                let line = json!({
                    "bot": session.bot,
                    "subscriber": session.subscriber,
                    "channel": session.channel,
                    "step": step,
                    "payload": payload,
                });
                let mut bytes = line.to_string().into_bytes();
                bytes.push(b'\n');
                if let Err(e) = stdout.write_all(&bytes).await {
                    tracing::error!(error = %e, "Failed to write bot message");
                    break;
                }
            }
        })
    }

    /// Wait until the shutdown flag is set
    pub async fn wait_for_shutdown(&self) {
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signals the daemon to shut down
    pub fn signal_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown_signaled(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Stop background tasks and close the database
    pub async fn graceful_shutdown(mut self) -> Result<()> {
        tracing::info!("Starting graceful shutdown");
        self.signal_shutdown();
        self.engine.bus.publish(Event::EngineStopping);

        for handle in self.task_handles.drain(..) {
            handle.abort();
        }
        tracing::info!("Background tasks stopped");

        if let Some(database) = self.database.take() {
            database.close().await.context("Failed to close database")?;
        }

        tracing::info!("Graceful shutdown completed");
        Ok(())
    }

    /// Set the shutdown flag on Ctrl-C or SIGTERM
    #[cfg(unix)]
    pub fn setup_signal_handler(shutdown_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable; listening for Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("Received Ctrl-C");
                }
            }
            shutdown_flag.store(true, Ordering::Relaxed);
        })
    }

    /// Set the shutdown flag on Ctrl-C
    #[cfg(not(unix))]
    pub fn setup_signal_handler(shutdown_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl-C");
            shutdown_flag.store(true, Ordering::Relaxed);
        })
    }
}

/// Queue JSON-line messages from `reader` until end of input.
///
/// Each line is submitted before the next one is read, so events for one
/// session reach it in line order. Malformed lines are logged and skipped.
/// Returns the number of events queued.
pub async fn run_ingress<R>(reader: R, queues: &SessionQueues) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut queued = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let inbound: InboundMessage = match serde_json::from_str(&line) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed inbound line");
                continue;
            }
        };
        let Some(event) = inbound.into_event() else {
            tracing::warn!("Ignoring inbound line without text or payload");
            continue;
        };

        queues.submit(event).await;
        queued += 1;
    }
    Ok(queued)
}

/// Open the database, assemble the engine and run until shutdown
pub async fn serve(config: &Config) -> Result<()> {
    let key = config.load_vault_key()?;
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;

    let engine = Engine::assemble(config, &key, Stores::sqlite(&database))?;
    let mut manager = DaemonManager::new(engine, Some(database));
    manager.start(config);

    manager.wait_for_shutdown().await;
    manager.graceful_shutdown().await
}
