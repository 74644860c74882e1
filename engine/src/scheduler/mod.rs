//! Emitter Scheduler
//!
//! Bridges a time-based job scheduler to the session machine. Each
//! [`Emitter`] binds an external job id to an entry step; when the job
//! fires, [`EmitterScheduler::on_fire`] turns the fire into
//! [`FlowEvent::Injected`] events for the emitter's audience.
//!
//! # Fire handling
//!
//! 1. Execution ids seen within the dedup window are dropped (at-least-once delivery)
//! 2. Unknown or inactive job ids are stale and dropped
//! 3. A random delay in `[0, jitter]` seconds is applied
//! 4. One event per target session; failures are isolated per session
//!
//! Payload substitution happens inside each session's transition, under
//! the session lock, so it sees the session's committed variables.

pub mod cron;
pub mod dedup;
pub mod recurrence;

pub use cron::CronDriver;
pub use dedup::DedupWindow;
pub use recurrence::{Recurrence, RecurrenceSpec};

use crate::config::SchedulerConfig;
use crate::message_bus::{Event, MessageBus};
use crate::session::{FlowEvent, SessionQueues};
use crate::store::{EmitterStore, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sdk::errors::EngineError;
use sdk::types::{BotId, ChannelId, EmitterId, RecurrenceId, SessionKey, StepId, SubscriberId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

fn default_true() -> bool {
    true
}

/// Who an emitter's fire reaches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmitterAudience {
    /// One subscriber on one channel
    Session {
        subscriber: SubscriberId,
        channel: ChannelId,
    },
    /// Every session of the owning bot
    Broadcast,
}

/// Binding between a scheduled job and a flow entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emitter {
    pub id: EmitterId,
    pub bot_id: BotId,
    pub name: String,
    pub target_step: Option<StepId>,
    pub job_id: String,
    #[serde(default)]
    pub recurrence: Option<RecurrenceId>,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub needs_message_processing: bool,
    pub audience: EmitterAudience,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// One delivery of a job fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFire {
    pub job_id: String,
    /// Unique per scheduled instant; repeated deliveries share it
    pub execution_id: String,
    pub scheduled_at: DateTime<Utc>,
}

/// External time-based job scheduler
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Add or replace a job
    async fn schedule(&self, job_id: &str, recurrence: Recurrence) -> Result<(), EngineError>;

    /// Remove a job; `false` if it was not scheduled
    async fn unschedule(&self, job_id: &str) -> Result<bool, EngineError>;

    /// Scheduled job ids with their recurrence fingerprints
    async fn jobs(&self) -> HashMap<String, String>;
}

/// What became of one fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireReport {
    /// Execution id already handled within the dedup window
    Duplicate,
    /// No active emitter owns the job id
    Stale,
    Dispatched {
        emitter: EmitterId,
        sessions: usize,
        failures: usize,
    },
}

/// Result of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub rescheduled: usize,
    pub removed: usize,
    pub deactivated: usize,
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub dedup_window: Duration,
    pub default_timezone: String,
    pub max_jitter_secs: u64,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            dedup_window: Duration::from_secs(config.dedup_window_secs),
            default_timezone: config.default_timezone.clone(),
            max_jitter_secs: config.max_jitter_secs,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// Uniform delay in `[0, min(jitter, cap)]` seconds
pub fn jitter_delay(jitter_secs: u64, cap_secs: u64) -> Duration {
    let bound = jitter_secs.min(cap_secs);
    if bound == 0 {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=bound * 1000);
    Duration::from_millis(millis)
}

/// Turns job fires into flow-entry events
pub struct EmitterScheduler {
    emitters: Arc<dyn EmitterStore>,
    sessions: Arc<dyn SessionStore>,
    queues: Arc<SessionQueues>,
    bus: Arc<MessageBus>,
    dedup: Mutex<DedupWindow>,
    settings: SchedulerSettings,
}

impl EmitterScheduler {
    pub fn new(
        emitters: Arc<dyn EmitterStore>,
        sessions: Arc<dyn SessionStore>,
        queues: Arc<SessionQueues>,
        bus: Arc<MessageBus>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            emitters,
            sessions,
            queues,
            bus,
            dedup: Mutex::new(DedupWindow::new(settings.dedup_window)),
            settings,
        }
    }

    /// Handle one job fire.
    ///
    /// Duplicate and stale fires are reported, not errors. Per-session
    /// transition failures are counted in the report and never abort the
    /// rest of a broadcast.
    ///
    /// # Errors
    ///
    /// Only persistence failures while resolving the emitter or its audience.
    pub async fn on_fire(&self, fire: JobFire) -> Result<FireReport, EngineError> {
        if !self.dedup.lock().await.check_and_insert(&fire.execution_id) {
            tracing::debug!(job_id = %fire.job_id, execution_id = %fire.execution_id, "Duplicate fire discarded");
            return Ok(FireReport::Duplicate);
        }

        let result = self.dispatch_fire(&fire).await;
        if let Err(e) = &result {
            // A redelivery of this execution must still be handled
            self.dedup.lock().await.forget(&fire.execution_id);
            tracing::error!(job_id = %fire.job_id, execution_id = %fire.execution_id, error = %e, "Fire handling failed");
        }
        result
    }

    async fn dispatch_fire(&self, fire: &JobFire) -> Result<FireReport, EngineError> {
        let emitter = match self.emitters.emitter_by_job(&fire.job_id).await? {
            Some(emitter) if emitter.is_active => emitter,
            _ => {
                tracing::warn!(job_id = %fire.job_id, "Stale job fire discarded");
                return Ok(FireReport::Stale);
            }
        };
        let Some(target) = emitter.target_step else {
            tracing::warn!(emitter = %emitter.id, "Emitter has no target step; fire discarded");
            return Ok(FireReport::Stale);
        };

        let jitter = match emitter.recurrence {
            Some(id) => self
                .emitters
                .recurrence(id)
                .await?
                .map(|spec| spec.jitter_secs)
                .unwrap_or(0),
            None => 0,
        };
        let delay = jitter_delay(jitter, self.settings.max_jitter_secs);
        if !delay.is_zero() {
            tracing::debug!(emitter = %emitter.id, delay_ms = delay.as_millis() as u64, "Applying jitter");
            tokio::time::sleep(delay).await;
        }

        let keys = match &emitter.audience {
            EmitterAudience::Session {
                subscriber,
                channel,
            } => vec![SessionKey::new(*subscriber, emitter.bot_id, *channel)],
            EmitterAudience::Broadcast => self.sessions.sessions_for_bot(emitter.bot_id).await?,
        };

        let mut failures = 0;
        for key in &keys {
            let event = FlowEvent::Injected {
                key: *key,
                target,
                payload: emitter.message.clone(),
                substitute: emitter.needs_message_processing,
                emitter: emitter.id,
            };
            if let Err(e) = self.queues.dispatch(event).await {
                failures += 1;
                tracing::warn!(emitter = %emitter.id, session = %key, error = %e, "Emitter injection failed");
            }
        }

        tracing::info!(
            emitter = %emitter.id,
            job_id = %fire.job_id,
            sessions = keys.len(),
            failures,
            "Emitter fired"
        );
        self.bus.publish(Event::EmitterFired {
            emitter: emitter.id,
            job_id: fire.job_id.clone(),
            sessions: keys.len(),
            failures,
        });

        Ok(FireReport::Dispatched {
            emitter: emitter.id,
            sessions: keys.len(),
            failures,
        })
    }

    /// Reconcile the job scheduler with the emitter store.
    ///
    /// Active emitters get a job with their current recurrence; jobs without
    /// an active emitter are removed. Emitters lacking a recurrence or a
    /// target step, or whose recurrence does not compile, are deactivated.
    pub async fn sync(&self, jobs: &dyn JobScheduler) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::default();
        let mut scheduled = jobs.jobs().await;

        for emitter in self.emitters.emitters().await? {
            if !emitter.is_active {
                continue;
            }

            let spec = match (emitter.recurrence, emitter.target_step) {
                (Some(id), Some(_)) => self.emitters.recurrence(id).await?,
                _ => None,
            };
            let compiled = spec
                .as_ref()
                .map(|s| Recurrence::compile(s, &self.settings.default_timezone));

            let recurrence = match compiled {
                Some(Ok(recurrence)) => recurrence,
                other => {
                    if let Some(Err(e)) = other {
                        tracing::warn!(emitter = %emitter.id, error = %e, "Invalid recurrence");
                    }
                    tracing::warn!(emitter = %emitter.id, job_id = %emitter.job_id, "Deactivating emitter without a usable schedule");
                    self.emitters.set_emitter_active(emitter.id, false).await?;
                    report.deactivated += 1;
                    continue;
                }
            };

            let fingerprint = recurrence.fingerprint();
            match scheduled.remove(&emitter.job_id) {
                Some(existing) if existing == fingerprint => {}
                Some(_) => {
                    jobs.schedule(&emitter.job_id, recurrence).await?;
                    report.rescheduled += 1;
                }
                None => {
                    jobs.schedule(&emitter.job_id, recurrence).await?;
                    report.added += 1;
                }
            }
        }

        for job_id in scheduled.keys() {
            if jobs.unschedule(job_id).await? {
                report.removed += 1;
            }
        }

        tracing::info!(
            added = report.added,
            rescheduled = report.rescheduled,
            removed = report.removed,
            deactivated = report.deactivated,
            "Emitter sync complete"
        );
        Ok(report)
    }

    /// Run [`sync`](Self::sync) every `interval` until the task is aborted
    pub fn spawn_sync_loop(
        self: &Arc<Self>,
        jobs: Arc<dyn JobScheduler>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.sync(jobs.as_ref()).await {
                    tracing::error!(error = %e, "Emitter sync failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for EmitterScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmitterScheduler")
            .field("settings", &self.settings)
            .finish()
    }
}
