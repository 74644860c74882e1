//! Emitter scheduler integration tests
//!
//! Fires are delivered by hand; recurrence math is checked against fixed
//! instants so no test waits for a real schedule.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use flowbot_engine::config::Config;
use flowbot_engine::crypto::VaultKey;
use flowbot_engine::daemon::{Engine, Stores};
use flowbot_engine::graph::definition::{CompiledFlow, FlowDefinition};
use flowbot_engine::message_bus::{Event, EventType};
use flowbot_engine::scheduler::{
    CronDriver, Emitter, FireReport, JobFire, JobScheduler, Recurrence, RecurrenceSpec,
};
use flowbot_engine::store::{EmitterStore, SessionStore, StoreResult};
use sdk::errors::EngineError;
use sdk::types::{ChannelId, EmitterId, RecurrenceId, SessionKey, StepId, SubscriberId};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NEWSLETTER: &str = r#"
[bot]
name = "newsletter"
start = "idle"

[[steps]]
key = "idle"
kind = "message"

[[steps]]
key = "digest"
kind = "message"
terminal = true

[[connections]]
from = "idle"
to = "digest"

[[recurrences]]
key = "morning"
hour = 9
timezone = "Europe/Kyiv"
jitter_secs = 300

[[emitters]]
key = "raw"
job_id = "job-raw"
target = "digest"
message = { text = "Hello {$session.name$}" }
needs_message_processing = false

[[emitters]]
key = "rendered"
job_id = "job-rendered"
target = "digest"
message = { text = "Hello {$session.name$}" }

[[emitters]]
key = "jittered"
job_id = "job-jittered"
target = "digest"
recurrence = "morning"

[[emitters]]
key = "paused"
job_id = "job-paused"
target = "digest"
active = false
"#;

async fn engine_with(config: &Config, flow: &str) -> (Engine, CompiledFlow) {
    let stores = Stores::memory();
    let flow = FlowDefinition::from_toml_str(flow)
        .unwrap()
        .import(stores.graphs.as_ref(), stores.emitters.as_ref())
        .await
        .unwrap();
    let engine = Engine::assemble(config, &VaultKey::generate(), stores).unwrap();
    (engine, flow)
}

async fn seed_session(engine: &Engine, key: SessionKey, at: StepId, variables: Value) {
    let mut record = engine
        .stores
        .sessions
        .get_or_create_session(key, at)
        .await
        .unwrap();
    record.variables = variables;
    engine.stores.sessions.save_session(&record).await.unwrap();
}

fn fire(job_id: &str, execution_id: &str) -> JobFire {
    JobFire {
        job_id: job_id.to_string(),
        execution_id: execution_id.to_string(),
        scheduled_at: Utc::now(),
    }
}

fn new_key(flow: &CompiledFlow) -> SessionKey {
    SessionKey::new(SubscriberId::new(), flow.bot.id, ChannelId::new())
}

fn bot_payloads(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> Vec<Value> {
    let mut payloads = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::BotMessage { payload, .. } = event {
            payloads.push(payload);
        }
    }
    payloads
}

#[tokio::test]
async fn test_duplicate_execution_is_dropped() {
    let (engine, flow) = engine_with(&Config::default_config(), NEWSLETTER).await;
    seed_session(&engine, new_key(&flow), flow.step_id("idle"), json!({})).await;

    let first = engine.scheduler.on_fire(fire("job-rendered", "job-rendered:1700000000")).await;
    assert!(matches!(
        first.unwrap(),
        FireReport::Dispatched { sessions: 1, failures: 0, .. }
    ));

    let again = engine.scheduler.on_fire(fire("job-rendered", "job-rendered:1700000000")).await;
    assert_eq!(again.unwrap(), FireReport::Duplicate);

    let next = engine.scheduler.on_fire(fire("job-rendered", "job-rendered:1700086400")).await;
    assert!(matches!(next.unwrap(), FireReport::Dispatched { .. }));
}

/// Emitter store whose next job lookup fails once
struct FlakyEmitters {
    inner: Arc<dyn EmitterStore>,
    fail_next: AtomicBool,
}

#[async_trait]
impl EmitterStore for FlakyEmitters {
    async fn emitter_by_job(&self, job_id: &str) -> StoreResult<Option<Emitter>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Database("connection reset".to_string()));
        }
        self.inner.emitter_by_job(job_id).await
    }

    async fn emitters(&self) -> StoreResult<Vec<Emitter>> {
        self.inner.emitters().await
    }

    async fn upsert_emitter(&self, emitter: &Emitter) -> StoreResult<()> {
        self.inner.upsert_emitter(emitter).await
    }

    async fn delete_emitter(&self, id: EmitterId) -> StoreResult<bool> {
        self.inner.delete_emitter(id).await
    }

    async fn set_emitter_active(&self, id: EmitterId, active: bool) -> StoreResult<()> {
        self.inner.set_emitter_active(id, active).await
    }

    async fn recurrence(&self, id: RecurrenceId) -> StoreResult<Option<RecurrenceSpec>> {
        self.inner.recurrence(id).await
    }

    async fn upsert_recurrence(&self, spec: &RecurrenceSpec) -> StoreResult<()> {
        self.inner.upsert_recurrence(spec).await
    }
}

#[tokio::test]
async fn test_failed_fire_is_accepted_on_redelivery() {
    let mut stores = Stores::memory();
    let flow = FlowDefinition::from_toml_str(NEWSLETTER)
        .unwrap()
        .import(stores.graphs.as_ref(), stores.emitters.as_ref())
        .await
        .unwrap();
    stores.emitters = Arc::new(FlakyEmitters {
        inner: Arc::clone(&stores.emitters),
        fail_next: AtomicBool::new(true),
    });
    let engine = Engine::assemble(&Config::default_config(), &VaultKey::generate(), stores).unwrap();
    seed_session(&engine, new_key(&flow), flow.step_id("idle"), json!({})).await;

    let first = engine.scheduler.on_fire(fire("job-rendered", "job-rendered:1700000000")).await;
    assert!(matches!(first, Err(EngineError::Database(_))));

    let redelivered = engine.scheduler.on_fire(fire("job-rendered", "job-rendered:1700000000")).await;
    assert!(matches!(
        redelivered.unwrap(),
        FireReport::Dispatched { sessions: 1, failures: 0, .. }
    ));
}

#[tokio::test]
async fn test_stale_fires_are_dropped() {
    let (engine, flow) = engine_with(&Config::default_config(), NEWSLETTER).await;
    let key = new_key(&flow);
    seed_session(&engine, key, flow.step_id("idle"), json!({})).await;

    let unknown = engine.scheduler.on_fire(fire("job-gone", "job-gone:1")).await;
    assert_eq!(unknown.unwrap(), FireReport::Stale);

    let inactive = engine.scheduler.on_fire(fire("job-paused", "job-paused:1")).await;
    assert_eq!(inactive.unwrap(), FireReport::Stale);

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.current_step, flow.step_id("idle"));
}

#[tokio::test]
async fn test_payload_substitution_flag() {
    let (engine, flow) = engine_with(&Config::default_config(), NEWSLETTER).await;
    let key = new_key(&flow);
    seed_session(&engine, key, flow.step_id("idle"), json!({"name": "Olena"})).await;
    let mut replies = engine.bus.subscribe(EventType::BotMessage);

    engine.scheduler.on_fire(fire("job-raw", "raw:1")).await.unwrap();
    assert_eq!(
        bot_payloads(&mut replies),
        vec![json!({"text": "Hello {$session.name$}"})]
    );

    engine.scheduler.on_fire(fire("job-rendered", "rendered:1")).await.unwrap();
    assert_eq!(bot_payloads(&mut replies), vec![json!({"text": "Hello Olena"})]);

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.current_step, flow.step_id("digest"));
}

#[tokio::test]
async fn test_broadcast_isolates_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let hooks = r#"
[bot]
name = "hooks"
start = "idle"

[[steps]]
key = "idle"
kind = "message"

[[steps]]
key = "notify"
kind = "request"
method = "POST"
url = "{$session.endpoint$}"
body = { subscriber = "{$subscriber.id$}" }

[[steps]]
key = "done"
kind = "message"
terminal = true

[[connections]]
from = "idle"
to = "notify"

[[connections]]
from = "notify"
to = "done"

[[emitters]]
key = "ping"
job_id = "job-ping"
target = "notify"
"#;
    let (engine, flow) = engine_with(&Config::default_config(), hooks).await;
    let hook = format!("{}/hook", server.uri());

    let good_a = new_key(&flow);
    let broken = new_key(&flow);
    let good_b = new_key(&flow);
    seed_session(&engine, good_a, flow.step_id("idle"), json!({"endpoint": hook})).await;
    seed_session(&engine, broken, flow.step_id("idle"), json!({"endpoint": "not a url"})).await;
    seed_session(&engine, good_b, flow.step_id("idle"), json!({"endpoint": hook})).await;

    let mut fired = engine.bus.subscribe(EventType::EmitterFired);
    let report = engine.scheduler.on_fire(fire("job-ping", "job-ping:1")).await.unwrap();
    assert_eq!(
        report,
        FireReport::Dispatched {
            emitter: flow.emitters[0].id,
            sessions: 3,
            failures: 1,
        }
    );

    for key in [good_a, good_b] {
        let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
        assert_eq!(session.current_step, flow.step_id("done"));
    }
    let session = engine.stores.sessions.session(broken).await.unwrap().unwrap();
    assert_eq!(session.current_step, flow.step_id("idle"));

    match fired.try_recv() {
        Ok(Event::EmitterFired { job_id, failures, .. }) => {
            assert_eq!(job_id, "job-ping");
            assert_eq!(failures, 1);
        }
        other => panic!("expected EmitterFired, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_jitter_delays_within_bound() {
    let (engine, flow) = engine_with(&Config::default_config(), NEWSLETTER).await;
    seed_session(&engine, new_key(&flow), flow.step_id("idle"), json!({})).await;

    let started = tokio::time::Instant::now();
    let report = engine.scheduler.on_fire(fire("job-jittered", "jittered:1")).await;
    assert!(matches!(report.unwrap(), FireReport::Dispatched { sessions: 1, .. }));
    assert!(started.elapsed() <= Duration::from_secs(300));
}

#[tokio::test(start_paused = true)]
async fn test_jitter_cap_from_config() {
    let mut config = Config::default_config();
    config.scheduler.max_jitter_secs = 0;
    let (engine, flow) = engine_with(&config, NEWSLETTER).await;
    seed_session(&engine, new_key(&flow), flow.step_id("idle"), json!({})).await;

    let started = tokio::time::Instant::now();
    engine.scheduler.on_fire(fire("job-jittered", "jittered:1")).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[test]
fn test_daily_kyiv_morning() {
    let spec = RecurrenceSpec {
        jitter_secs: 300,
        ..RecurrenceSpec::daily_at(RecurrenceId::new(), 9, 0, "Europe/Kyiv")
    };
    let recurrence = Recurrence::compile(&spec, "UTC").unwrap();
    assert_eq!(recurrence.expression(), "0 0 9 * * * *");

    // UTC+2 in winter, UTC+3 in summer
    let winter = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    assert_eq!(
        recurrence.next_after(winter),
        Some(Utc.with_ymd_and_hms(2024, 1, 15, 7, 0, 0).unwrap())
    );
    let summer = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();
    assert_eq!(
        recurrence.next_after(summer),
        Some(Utc.with_ymd_and_hms(2024, 7, 15, 6, 0, 0).unwrap())
    );

    let at_fire = Utc.with_ymd_and_hms(2024, 1, 15, 7, 0, 0).unwrap();
    assert_eq!(
        recurrence.next_after(at_fire),
        Some(Utc.with_ymd_and_hms(2024, 1, 16, 7, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_sync_schedules_and_deactivates() {
    let (engine, flow) = engine_with(&Config::default_config(), NEWSLETTER).await;
    let (driver, _fires) = CronDriver::new(16);

    let report = engine.scheduler.sync(&driver).await.unwrap();
    assert_eq!(report.added, 1);
    // raw and rendered have no recurrence; paused is skipped
    assert_eq!(report.deactivated, 2);

    let jobs = driver.jobs().await;
    assert!(jobs.contains_key("job-jittered"));
    assert_eq!(jobs.len(), 1);

    let again = engine.scheduler.sync(&driver).await.unwrap();
    assert_eq!(again.added, 0);
    assert_eq!(again.rescheduled, 0);
    assert_eq!(again.deactivated, 0);

    let raw = flow.emitters.iter().find(|e| e.job_id == "job-raw").unwrap();
    let stored = engine
        .stores
        .emitters
        .emitter_by_job(&raw.job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.is_active);

    // Deleting the emitter removes its job on the next pass
    let jittered = flow.emitters.iter().find(|e| e.job_id == "job-jittered").unwrap();
    engine.stores.emitters.delete_emitter(jittered.id).await.unwrap();
    let removed = engine.scheduler.sync(&driver).await.unwrap();
    assert_eq!(removed.removed, 1);
    assert!(driver.jobs().await.is_empty());
}
