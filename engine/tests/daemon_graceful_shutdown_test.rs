//! Integration tests for daemon graceful shutdown
//!
//! The manager is driven without `start()`, which would attach to the test
//! process's stdin.

use flowbot_engine::config::Config;
use flowbot_engine::crypto::VaultKey;
use flowbot_engine::daemon::{DaemonManager, Engine, Stores};
use flowbot_engine::db::Database;
use flowbot_engine::graph::definition::FlowDefinition;
use flowbot_engine::message_bus::{Event, EventType};
use flowbot_engine::session::FlowEvent;
use flowbot_engine::store::SessionStore;
use sdk::types::{ChannelId, SessionKey, SubscriberId};
use std::time::Duration;
use tempfile::TempDir;

const FLOW: &str = r#"
[bot]
name = "shutdown"
start = "ask"

[[steps]]
key = "ask"
kind = "message"
save = { "message.text" = "answer" }

[[steps]]
key = "thanks"
kind = "message"
terminal = true
message = { text = "Thanks!" }

[[connections]]
from = "ask"
to = "thanks"
"#;

fn create_test_config(temp_dir: &TempDir) -> Config {
    let config_content = format!(
        r#"
[core]
log_level = "info"
data_dir = "{}"

[scheduler]
sync_interval_secs = 1
"#,
        temp_dir.path().display()
    );

    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, config_content).unwrap();
    Config::load_from_path(&config_path).unwrap()
}

#[tokio::test]
async fn test_graceful_shutdown_sequence() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    let key = VaultKey::generate();

    let database = Database::new(&config.database_path()).await.unwrap();
    let flow = FlowDefinition::from_toml_str(FLOW)
        .unwrap()
        .import(&database.graphs(), &database.emitters())
        .await
        .unwrap();

    let engine = Engine::assemble(&config, &key, Stores::sqlite(&database)).unwrap();
    let session = SessionKey::new(SubscriberId::new(), flow.bot.id, ChannelId::new());
    engine
        .machine
        .handle(FlowEvent::text(session, "bye"))
        .await
        .unwrap();

    let mut stopping = engine.bus.subscribe(EventType::EngineStopping);
    let manager = DaemonManager::new(engine, Some(database));
    assert!(!manager.is_shutdown_signaled());

    manager.signal_shutdown();
    tokio::time::timeout(Duration::from_secs(1), manager.wait_for_shutdown())
        .await
        .expect("wait_for_shutdown should return once signalled");

    manager.graceful_shutdown().await.unwrap();
    assert!(matches!(stopping.try_recv(), Ok(Event::EngineStopping)));

    // Everything committed before shutdown is on disk
    let reopened = Database::new(&config.database_path()).await.unwrap();
    let record = reopened.sessions().session(session).await.unwrap().unwrap();
    assert_eq!(record.current_step, flow.step_id("thanks"));
    assert_eq!(record.variables["answer"], "bye");
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_without_database() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    let engine = Engine::assemble(&config, &VaultKey::generate(), Stores::memory()).unwrap();

    let manager = DaemonManager::new(engine, None);
    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flag_from_another_task() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    let engine = Engine::assemble(&config, &VaultKey::generate(), Stores::memory()).unwrap();
    let manager = std::sync::Arc::new(DaemonManager::new(engine, None));

    let signaller = std::sync::Arc::clone(&manager);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        signaller.signal_shutdown();
    });

    tokio::time::timeout(Duration::from_secs(2), manager.wait_for_shutdown())
        .await
        .expect("shutdown signal should be observed");
    assert!(manager.is_shutdown_signaled());
}
