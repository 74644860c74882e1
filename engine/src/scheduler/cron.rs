//! In-process cron driver
//!
//! [`CronDriver`] is the default [`JobScheduler`]: one tokio task per job
//! sleeps until the recurrence's next instant and sends a [`JobFire`] on a
//! channel. The receiving side dispatches fires to
//! [`EmitterScheduler::on_fire`](super::EmitterScheduler::on_fire).
//!
//! Execution ids are `"{job_id}:{unix_ts}"` of the scheduled instant, so a
//! repeated delivery of one instant is caught by the dedup window.

use super::{JobFire, JobScheduler, Recurrence};
use async_trait::async_trait;
use chrono::Utc;
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct JobHandle {
    fingerprint: String,
    /// Distinguishes a job from a later replacement under the same id
    generation: u64,
    task: JoinHandle<()>,
}

type JobTable = Arc<Mutex<HashMap<String, JobHandle>>>;

/// Cron-expression job scheduler backed by tokio timers
///
/// A job whose recurrence has no further fires removes itself, so the next
/// sync pass sees it as missing.
pub struct CronDriver {
    tx: mpsc::Sender<JobFire>,
    jobs: JobTable,
    generations: AtomicU64,
}

impl CronDriver {
    /// Create a driver and the receiver its fires arrive on
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<JobFire>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                jobs: Arc::new(Mutex::new(HashMap::new())),
                generations: AtomicU64::new(0),
            },
            rx,
        )
    }

    fn spawn_job(&self, job_id: String, generation: u64, recurrence: Recurrence) -> JoinHandle<()> {
        let tx = self.tx.clone();
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let mut cursor = Utc::now();
            loop {
                let Some(next) = recurrence.next_after(cursor) else {
                    tracing::info!(job_id = %job_id, "Job has no further fires");
                    break;
                };

                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                let fire = JobFire {
                    execution_id: format!("{}:{}", job_id, next.timestamp()),
                    job_id: job_id.clone(),
                    scheduled_at: next,
                };
                tracing::trace!(job_id = %job_id, execution_id = %fire.execution_id, "Job fired");
                if tx.send(fire).await.is_err() {
                    tracing::debug!(job_id = %job_id, "Fire receiver closed; job stopped");
                    break;
                }
                cursor = next.max(Utc::now());
            }

            let mut jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
            if jobs.get(&job_id).is_some_and(|h| h.generation == generation) {
                jobs.remove(&job_id);
            }
        })
    }
}

#[async_trait]
impl JobScheduler for CronDriver {
    async fn schedule(&self, job_id: &str, recurrence: Recurrence) -> Result<(), EngineError> {
        let fingerprint = recurrence.fingerprint();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        // Held across the spawn so a job that ends at once finds its own entry
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let task = self.spawn_job(job_id.to_string(), generation, recurrence);
        let handle = JobHandle {
            fingerprint,
            generation,
            task,
        };
        if let Some(previous) = jobs.insert(job_id.to_string(), handle) {
            previous.task.abort();
        }
        Ok(())
    }

    async fn unschedule(&self, job_id: &str) -> Result<bool, EngineError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match jobs.remove(job_id) {
            Some(handle) => {
                handle.task.abort();
                true
            }
            None => false,
        })
    }

    async fn jobs(&self) -> HashMap<String, String> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.iter()
            .map(|(id, handle)| (id.clone(), handle.fingerprint.clone()))
            .collect()
    }
}

impl Drop for CronDriver {
    fn drop(&mut self) {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for handle in jobs.values() {
            handle.task.abort();
        }
    }
}

impl std::fmt::Debug for CronDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.jobs.lock().map(|j| j.len()).unwrap_or(0);
        f.debug_struct("CronDriver").field("jobs", &count).finish()
    }
}
