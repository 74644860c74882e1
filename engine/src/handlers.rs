//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - keygen: Generate a vault key
//! - import: Load a flow definition into the database
//! - send: Deliver one message and print the replies
//! - serve: Run the engine in the foreground
//! - credential: Administer sealed credentials
//! - config show: Print the effective configuration

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::cli::CredentialAction;
use crate::config::Config;
use crate::crypto::VaultKey;
use crate::daemon::{Engine, Stores};
use crate::db::Database;
use crate::graph::definition::FlowDefinition;
use crate::message_bus::{Event, EventType};
use crate::secrets::SecretValue;
use crate::session::FlowEvent;
use crate::vault::NewCredential;
use sdk::types::{BotId, ChannelId, SessionKey, SubscriberId};

/// Version string shown by `flowbot --version`
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_COMMIT_HASH"),
    " ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Print a freshly generated vault key
pub fn handle_keygen(format: OutputFormat) -> Result<()> {
    let key = VaultKey::generate();
    let encoded = key.to_hex();

    match format {
        OutputFormat::Text => {
            println!("{}", encoded.as_str());
            eprintln!("Store this key in FLOWBOT_VAULT_KEY or [vault].key. Losing it makes every credential unreadable.");
        }
        OutputFormat::Json => {
            println!("{}", json!({ "key": encoded.as_str() }));
        }
    }

    Ok(())
}

/// Import a flow definition into the database
pub async fn handle_import(path: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let definition = FlowDefinition::from_path(path)
        .with_context(|| format!("Failed to load flow {}", path.display()))?;

    let database = open_database(config).await?;
    let stores = Stores::sqlite(&database);
    let flow = definition
        .import(stores.graphs.as_ref(), stores.emitters.as_ref())
        .await
        .context("Failed to import flow")?;
    database.close().await?;

    match format {
        OutputFormat::Text => {
            println!("Imported bot '{}' ({})", flow.bot.name, flow.bot.id);
            println!("  Steps: {}", flow.steps.len());
            println!("  Connections: {}", flow.connections.len());
            println!("  Emitters: {}", flow.emitters.len());
        }
        OutputFormat::Json => {
            let output = json!({
                "bot": flow.bot.id,
                "name": flow.bot.name,
                "steps": flow.steps.len(),
                "connections": flow.connections.len(),
                "emitters": flow.emitters.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Arguments of `flowbot send`
#[derive(Debug, Clone)]
pub struct SendArgs {
    pub bot: Option<BotId>,
    pub subscriber: Option<SubscriberId>,
    pub channel: Option<ChannelId>,
    pub flow: Option<std::path::PathBuf>,
    pub text: String,
}

/// Deliver one message and print the bot messages it produced.
///
/// With `--flow` the flow is imported into an in-memory store and nothing
/// is persisted; request steps still perform real calls.
pub async fn handle_send(args: SendArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let subscriber = args
        .subscriber
        .unwrap_or_else(|| SubscriberId::derived(&Uuid::nil(), "cli-subscriber"));
    let channel = args
        .channel
        .unwrap_or_else(|| ChannelId::derived(&Uuid::nil(), "cli-channel"));

    let (engine, bot, database) = match &args.flow {
        Some(path) => {
            let definition = FlowDefinition::from_path(path)
                .with_context(|| format!("Failed to load flow {}", path.display()))?;
            let stores = Stores::memory();
            definition
                .import(stores.graphs.as_ref(), stores.emitters.as_ref())
                .await?;
            let key = config.load_vault_key().unwrap_or_else(|_| VaultKey::generate());
            let engine = Engine::assemble(config, &key, stores)?;
            (engine, definition.bot_id(), None)
        }
        None => {
            let bot = args
                .bot
                .context("--bot is required unless --flow is given")?;
            let key = config.load_vault_key()?;
            let database = open_database(config).await?;
            let engine = Engine::assemble(config, &key, Stores::sqlite(&database))?;
            (engine, bot, Some(database))
        }
    };

    let mut replies = engine.bus.subscribe(EventType::BotMessage);
    let key = SessionKey::new(subscriber, bot, channel);
    let outcome = engine
        .machine
        .handle(FlowEvent::text(key, args.text))
        .await
        .context("Transition failed")?;

    let mut payloads: Vec<Value> = Vec::new();
    while let Ok(event) = replies.try_recv() {
        if let Event::BotMessage { payload, .. } = event {
            payloads.push(payload);
        }
    }

    if let Some(database) = database {
        database.close().await?;
    }

    match format {
        OutputFormat::Text => {
            for payload in &payloads {
                match payload.get("text").and_then(Value::as_str) {
                    Some(text) => println!("bot> {}", text),
                    None => println!("bot> {}", payload),
                }
            }
            println!(
                "Session now at step {} ({:?}, {} hops)",
                outcome.to, outcome.halt, outcome.hops
            );
        }
        OutputFormat::Json => {
            let output = json!({
                "session": {
                    "bot": bot,
                    "subscriber": subscriber,
                    "channel": channel,
                },
                "from": outcome.from,
                "to": outcome.to,
                "halt": format!("{:?}", outcome.halt),
                "hops": outcome.hops,
                "messages": payloads,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Administer credentials
pub async fn handle_credential(
    action: CredentialAction,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let key = config.load_vault_key()?;
    let database = open_database(config).await?;
    let engine = Engine::assemble(config, &key, Stores::sqlite(&database))?;
    let vault = &engine.vault;

    match action {
        CredentialAction::Add {
            bot,
            provider,
            strategy,
            label,
            scopes,
            default,
            payload,
        } => {
            let raw = match payload {
                Some(raw) => raw,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin()
                        .read_to_string(&mut buf)
                        .await
                        .context("Failed to read payload from stdin")?;
                    buf
                }
            };
            let payload: Value =
                serde_json::from_str(raw.trim()).context("Credential payload must be JSON")?;

            let info = vault
                .create(NewCredential {
                    bot_id: bot,
                    provider,
                    strategy,
                    label,
                    scopes,
                    is_default: default,
                    payload: SecretValue::new(payload),
                })
                .await?;

            match format {
                OutputFormat::Text => println!("Credential {} stored", info.id),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            }
        }

        CredentialAction::List { bot } => {
            let credentials = vault.list(bot).await?;
            match format {
                OutputFormat::Text => {
                    if credentials.is_empty() {
                        println!("No credentials for bot {}", bot);
                    }
                    for info in &credentials {
                        println!(
                            "{}  {}/{}{}  {}",
                            info.id,
                            info.provider,
                            info.strategy,
                            if info.is_default { " (default)" } else { "" },
                            info.label
                        );
                        if !info.scopes.is_empty() {
                            println!("  Scopes: {}", info.scopes.join(", "));
                        }
                    }
                }
                OutputFormat::Json => {
                    let output = json!({
                        "credentials": credentials,
                        "count": credentials.len(),
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }

        CredentialAction::SetDefault { id } => {
            vault.set_default(id).await?;
            match format {
                OutputFormat::Text => println!("Credential {} is now the default", id),
                OutputFormat::Json => println!("{}", json!({ "id": id, "is_default": true })),
            }
        }

        CredentialAction::Delete { id } => {
            let removed = vault.delete(id).await?;
            match format {
                OutputFormat::Text if removed => println!("Credential {} deleted", id),
                OutputFormat::Text => println!("Credential {} not found", id),
                OutputFormat::Json => println!("{}", json!({ "id": id, "deleted": removed })),
            }
        }
    }

    drop(engine);
    database.close().await?;
    Ok(())
}

/// Print the effective configuration with any inline vault key redacted
pub fn handle_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    let mut shown = config.clone();
    if shown.vault.key.is_some() {
        shown.vault.key = Some("<redacted>".to_string());
    }

    match format {
        OutputFormat::Text => print!("{}", toml::to_string_pretty(&shown)?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
    }

    Ok(())
}

async fn open_database(config: &Config) -> Result<Database> {
    Database::new(&config.database_path())
        .await
        .context("Failed to open database")
}
