//! End-to-end transition tests over in-memory stores
//!
//! Outbound calls go to wiremock servers; flows are declared in TOML the
//! same way `flowbot import` reads them.

use flowbot_engine::config::Config;
use flowbot_engine::crypto::VaultKey;
use flowbot_engine::daemon::{run_ingress, Engine, Stores};
use flowbot_engine::graph::definition::{CompiledFlow, FlowDefinition};
use flowbot_engine::message_bus::{Event, EventType};
use flowbot_engine::secrets::SecretValue;
use flowbot_engine::session::{FlowEvent, HaltReason};
use flowbot_engine::store::SessionStore;
use flowbot_engine::vault::NewCredential;
use sdk::errors::EngineError;
use sdk::types::{BotId, ChannelId, SessionKey, SubscriberId};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::sync::mpsc::Receiver;
use wiremock::matchers::{any, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ONBOARDING: &str = r#"
[bot]
name = "onboarding"
start = "hello"

[[steps]]
key = "hello"
kind = "message"
message = { text = "Hi there!" }

[[steps]]
key = "ask-name"
kind = "message"
message = { text = "What is your name?" }
save = { "message.text" = "name" }

[[steps]]
key = "confirm"
kind = "conditional"
preset = "if"
condition = { rules = [{ field = "name", operator = "length_greater_than", value = 1 }] }

[[steps]]
key = "welcome"
kind = "message"
terminal = true
message = { text = "Welcome, {$session.name$}!" }

[[connections]]
from = "hello"
to = "ask-name"

[[connections]]
from = "ask-name"
to = "confirm"

[[connections]]
from = "confirm"
to = "welcome"
label = "true"

[[connections]]
from = "confirm"
to = "ask-name"
label = "false"
"#;

/// `ask` captures an email, `lookup` queries the CRM and branches
const CRM_LOOKUP: &str = r#"
[bot]
name = "crm-lookup"
start = "ask"

[bot.variables]
crm_url = "CRM_URL"

[[steps]]
key = "ask"
kind = "message"
message = { text = "Your email?" }
save = { "message.text" = "email" }

[[steps]]
key = "lookup"
kind = "request"
url = "{$bot.crm_url$}/contacts"
query = { email = "{$session.email$}" }
credential = { provider = "crm", strategy = "bearer" }
save = { "response.body.name" = "contact_name" }
TIMEOUT

[[steps]]
key = "found"
kind = "message"
terminal = true
message = { text = "Found {$session.contact_name$}" }

[[steps]]
key = "failed"
kind = "message"
terminal = true
message = { text = "Lookup failed" }

[[connections]]
from = "ask"
to = "lookup"

[[connections]]
from = "lookup"
to = "found"

ERROR_BRANCH
"#;

const ERROR_BRANCH: &str = r#"
[[connections]]
from = "lookup"
to = "failed"
label = "error"
"#;

fn crm_flow(crm_url: &str, timeout_secs: Option<u64>, error_branch: bool) -> String {
    CRM_LOOKUP
        .replace("CRM_URL", crm_url)
        .replace(
            "TIMEOUT",
            &timeout_secs
                .map(|t| format!("timeout_secs = {}", t))
                .unwrap_or_default(),
        )
        .replace("ERROR_BRANCH", if error_branch { ERROR_BRANCH } else { "" })
}

async fn engine_with(config: &Config, flows: &[&str]) -> (Engine, Vec<CompiledFlow>) {
    let stores = Stores::memory();
    let mut compiled = Vec::new();
    for flow in flows {
        let definition = FlowDefinition::from_toml_str(flow).unwrap();
        compiled.push(
            definition
                .import(stores.graphs.as_ref(), stores.emitters.as_ref())
                .await
                .unwrap(),
        );
    }
    let engine = Engine::assemble(config, &VaultKey::generate(), stores).unwrap();
    (engine, compiled)
}

fn session_for(bot: BotId) -> SessionKey {
    SessionKey::new(SubscriberId::new(), bot, ChannelId::new())
}

fn drain_texts(rx: &mut Receiver<Event>) -> Vec<String> {
    let mut texts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::BotMessage { payload, .. } = event {
            texts.push(
                payload
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            );
        }
    }
    texts
}

async fn add_crm_token(engine: &Engine, bot: BotId, token: &str) {
    engine
        .vault
        .create(NewCredential {
            bot_id: bot,
            provider: "crm".to_string(),
            strategy: "bearer".to_string(),
            label: "main".to_string(),
            scopes: vec!["contacts:read".to_string()],
            is_default: false,
            payload: SecretValue::new(json!({ "token": token })),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_onboarding_flow() {
    let (engine, flows) = engine_with(&Config::default_config(), &[ONBOARDING]).await;
    let flow = &flows[0];
    let key = session_for(flow.bot.id);
    let mut replies = engine.bus.subscribe(EventType::BotMessage);

    // First contact sits at the start step and moves on to the question
    let outcome = engine.machine.handle(FlowEvent::text(key, "hey")).await.unwrap();
    assert_eq!(outcome.from, flow.step_id("hello"));
    assert_eq!(outcome.to, flow.step_id("ask-name"));
    assert_eq!(outcome.halt, HaltReason::AwaitingInput);
    assert_eq!(drain_texts(&mut replies), vec!["What is your name?"]);

    // Too short: the conditional loops back and asks again
    let outcome = engine.machine.handle(FlowEvent::text(key, "x")).await.unwrap();
    assert_eq!(outcome.to, flow.step_id("ask-name"));
    assert_eq!(outcome.hops, 1);
    assert_eq!(drain_texts(&mut replies), vec!["What is your name?"]);

    let outcome = engine.machine.handle(FlowEvent::text(key, "Olena")).await.unwrap();
    assert_eq!(outcome.to, flow.step_id("welcome"));
    assert_eq!(drain_texts(&mut replies), vec!["Welcome, Olena!"]);

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.current_step, flow.step_id("welcome"));
    assert_eq!(session.variables["name"], "Olena");

    // Terminal step: the next message re-enters at the start step
    let outcome = engine.machine.handle(FlowEvent::text(key, "again")).await.unwrap();
    assert_eq!(outcome.to, flow.step_id("hello"));
    assert_eq!(drain_texts(&mut replies), vec!["Hi there!"]);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let (engine, flows) = engine_with(&Config::default_config(), &[ONBOARDING]).await;
    let flow = &flows[0];
    let first = session_for(flow.bot.id);
    let second = session_for(flow.bot.id);

    engine.machine.handle(FlowEvent::text(first, "hey")).await.unwrap();
    engine.machine.handle(FlowEvent::text(first, "Olena")).await.unwrap();
    engine.machine.handle(FlowEvent::text(second, "hey")).await.unwrap();

    let a = engine.stores.sessions.session(first).await.unwrap().unwrap();
    let b = engine.stores.sessions.session(second).await.unwrap().unwrap();
    assert_eq!(a.current_step, flow.step_id("welcome"));
    assert_eq!(b.current_step, flow.step_id("ask-name"));
    assert!(b.variables.get("name").is_none());
}

#[tokio::test]
async fn test_global_connection_jumps_from_any_step() {
    let flow_toml = format!(
        "{}\n[[global_connections]]\nlabel = \"restart\"\nto = \"hello\"\n",
        ONBOARDING
    );
    let (engine, flows) = engine_with(&Config::default_config(), &[flow_toml.as_str()]).await;
    let flow = &flows[0];
    let key = session_for(flow.bot.id);
    let mut replies = engine.bus.subscribe(EventType::BotMessage);

    engine.machine.handle(FlowEvent::text(key, "hey")).await.unwrap();
    drain_texts(&mut replies);

    // Matched before ask-name captures the text as a name
    let outcome = engine.machine.handle(FlowEvent::text(key, "Restart")).await.unwrap();
    assert_eq!(outcome.from, flow.step_id("ask-name"));
    assert_eq!(outcome.to, flow.step_id("hello"));
    assert_eq!(outcome.halt, HaltReason::AwaitingInput);
    assert_eq!(drain_texts(&mut replies), vec!["Hi there!"]);

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert!(session.variables.get("name").is_none());

    // Any other text still follows the step's own connection
    let outcome = engine.machine.handle(FlowEvent::text(key, "hey")).await.unwrap();
    assert_eq!(outcome.to, flow.step_id("ask-name"));
}

#[tokio::test]
async fn test_request_step_sends_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/contacts"))
        .and(query_param("email", "ann@example.com"))
        .and(header("Authorization", "Bearer t0k3n"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ann"})))
        .expect(1)
        .mount(&server)
        .await;

    let flow_toml = crm_flow(&server.uri(), None, true);
    let (engine, flows) = engine_with(&Config::default_config(), &[flow_toml.as_str()]).await;
    let flow = &flows[0];
    add_crm_token(&engine, flow.bot.id, "t0k3n").await;

    let key = session_for(flow.bot.id);
    let mut replies = engine.bus.subscribe(EventType::BotMessage);
    let outcome = engine
        .machine
        .handle(FlowEvent::text(key, "ann@example.com"))
        .await
        .unwrap();

    assert_eq!(outcome.to, flow.step_id("found"));
    assert_eq!(drain_texts(&mut replies), vec!["Found Ann"]);

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.variables["response"]["status"], 200);
    assert_eq!(session.variables["contact_name"], "Ann");
}

#[tokio::test]
async fn test_missing_credential_follows_error_branch() {
    let server = MockServer::start().await;
    let flow_toml = crm_flow(&server.uri(), None, true);
    let (engine, flows) = engine_with(&Config::default_config(), &[flow_toml.as_str()]).await;
    let flow = &flows[0];

    let key = session_for(flow.bot.id);
    let outcome = engine
        .machine
        .handle(FlowEvent::text(key, "ann@example.com"))
        .await
        .unwrap();
    assert_eq!(outcome.to, flow.step_id("failed"));

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.variables["last_error"]["step"], "lookup");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_without_error_branch_leaves_session_unchanged() {
    let server = MockServer::start().await;
    let flow_toml = crm_flow(&server.uri(), None, false);
    let (engine, flows) = engine_with(&Config::default_config(), &[flow_toml.as_str()]).await;
    let flow = &flows[0];

    let key = session_for(flow.bot.id);
    let mut replies = engine.bus.subscribe(EventType::BotMessage);
    let mut failures = engine.bus.subscribe(EventType::TransitionFailed);

    let result = engine
        .machine
        .handle(FlowEvent::text(key, "ann@example.com"))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::CredentialResolutionFailed { .. })
    ));

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.current_step, flow.step_id("ask"));
    assert!(session.variables.get("email").is_none());

    assert!(drain_texts(&mut replies).is_empty());
    match failures.try_recv() {
        Ok(Event::TransitionFailed { session, step, .. }) => {
            assert_eq!(session, key);
            assert_eq!(step, Some(flow.step_id("ask")));
        }
        other => panic!("expected TransitionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"name": "Late"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let flow_toml = crm_flow(&server.uri(), Some(1), true);
    let (engine, flows) = engine_with(&Config::default_config(), &[flow_toml.as_str()]).await;
    let flow = &flows[0];
    add_crm_token(&engine, flow.bot.id, "t0k3n").await;

    let key = session_for(flow.bot.id);
    let started = Instant::now();
    let outcome = engine
        .machine
        .handle(FlowEvent::text(key, "ann@example.com"))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(outcome.to, flow.step_id("failed"));
    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert!(session.variables["last_error"]["error"]
        .as_str()
        .unwrap()
        .contains("timed out"));
}

#[tokio::test]
async fn test_proxy_is_isolated_per_call() {
    let proxy = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("via-proxy"))
        .mount(&proxy)
        .await;

    let direct = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("direct"))
        .mount(&direct)
        .await;

    let proxied_flow = format!(
        r#"
[bot]
name = "proxied"
start = "ask"

[[steps]]
key = "ask"
kind = "message"

[[steps]]
key = "fetch"
kind = "request"
url = "http://upstream.flowbot.test/data"
proxy = "{}"

[[steps]]
key = "done"
kind = "message"
terminal = true

[[connections]]
from = "ask"
to = "fetch"

[[connections]]
from = "fetch"
to = "done"
"#,
        proxy.uri()
    );
    let direct_flow = proxied_flow
        .replace("name = \"proxied\"", "name = \"direct\"")
        .replace("http://upstream.flowbot.test/data", &format!("{}/data", direct.uri()))
        .replace(&format!("proxy = \"{}\"", proxy.uri()), "");

    let (engine, flows) =
        engine_with(&Config::default_config(), &[&proxied_flow, &direct_flow]).await;
    let proxied_key = session_for(flows[0].bot.id);
    let direct_key = session_for(flows[1].bot.id);

    let (a, b) = tokio::join!(
        engine.machine.handle(FlowEvent::text(proxied_key, "go")),
        engine.machine.handle(FlowEvent::text(direct_key, "go")),
    );
    a.unwrap();
    b.unwrap();

    let proxied = engine.stores.sessions.session(proxied_key).await.unwrap().unwrap();
    let direct_session = engine.stores.sessions.session(direct_key).await.unwrap().unwrap();
    assert_eq!(proxied.variables["response"]["body"], "via-proxy");
    assert_eq!(direct_session.variables["response"]["body"], "direct");

    assert_eq!(proxy.received_requests().await.unwrap().len(), 1);
    assert_eq!(direct.received_requests().await.unwrap().len(), 1);
}

const JOURNAL: &str = r#"
[bot]
name = "journal"
start = "log"

[[steps]]
key = "log"
kind = "message"
terminal = true
save = { "message.text" = "log|a" }
"#;

fn inbound_line(key: SessionKey, text: &str) -> String {
    json!({
        "bot": key.bot,
        "subscriber": key.subscriber,
        "channel": key.channel,
        "text": text,
    })
    .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ingress_keeps_arrival_order_per_session() {
    let (engine, flows) = engine_with(&Config::default_config(), &[JOURNAL]).await;
    let flow = &flows[0];
    let first = session_for(flow.bot.id);
    let second = session_for(flow.bot.id);

    let mut input = String::new();
    for n in 0..200 {
        input.push_str(&inbound_line(first, &n.to_string()));
        input.push('\n');
        input.push_str(&inbound_line(second, &n.to_string()));
        input.push('\n');
    }
    input.push_str("not json\n");

    let queued = run_ingress(BufReader::new(input.as_bytes()), &engine.queues)
        .await
        .unwrap();
    assert_eq!(queued, 400);

    // Waiting on one more event drains everything queued before it
    for key in [first, second] {
        engine.queues.dispatch(FlowEvent::text(key, "end")).await.unwrap();
    }

    let mut expected: Vec<Value> = (0..200).map(|n| json!(n.to_string())).collect();
    expected.push(json!("end"));
    for key in [first, second] {
        let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
        assert_eq!(session.variables["log"], Value::Array(expected.clone()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_emitter_and_message_share_session_order() {
    let (engine, flows) = engine_with(&Config::default_config(), &[JOURNAL]).await;
    let flow = &flows[0];
    let key = session_for(flow.bot.id);

    engine.queues.submit(FlowEvent::text(key, "a")).await;
    engine
        .queues
        .submit(FlowEvent::Injected {
            key,
            target: flow.step_id("log"),
            payload: None,
            substitute: false,
            emitter: sdk::types::EmitterId::new(),
        })
        .await;
    engine.queues.dispatch(FlowEvent::text(key, "b")).await.unwrap();

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.variables["log"], json!(["a", "b"]));
}

#[tokio::test]
async fn test_hop_limit_aborts_transition() {
    let looping = r#"
[bot]
name = "looping"
start = "start"

[[steps]]
key = "start"
kind = "message"

[[steps]]
key = "a"
kind = "proxy"

[[steps]]
key = "b"
kind = "proxy"

[[connections]]
from = "start"
to = "a"

[[connections]]
from = "a"
to = "b"

[[connections]]
from = "b"
to = "a"
"#;
    let mut config = Config::default_config();
    config.engine.max_hops_per_transition = 8;
    let (engine, flows) = engine_with(&config, &[looping]).await;
    let flow = &flows[0];
    let key = session_for(flow.bot.id);

    let result = engine.machine.handle(FlowEvent::text(key, "go")).await;
    assert!(matches!(result, Err(EngineError::HopLimitExceeded(8))));

    let session = engine.stores.sessions.session(key).await.unwrap().unwrap();
    assert_eq!(session.current_step, flow.step_id("start"));
}

#[tokio::test]
async fn test_unknown_bot_is_rejected() {
    let (engine, _) = engine_with(&Config::default_config(), &[ONBOARDING]).await;
    let key = session_for(BotId::new());

    let result = engine.machine.handle(FlowEvent::text(key, "hi")).await;
    assert!(matches!(result, Err(EngineError::InvalidGraph(_))));
    assert!(engine.stores.sessions.session(key).await.unwrap().is_none());
}
