//! CLI interface for flowbot
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for driving the engine.

use clap::{Parser, Subcommand};
use sdk::types::{BotId, ChannelId, CredentialId, SubscriberId};
use std::path::PathBuf;

/// Flowbot conversation flow engine
///
/// Runs step-graph chatbot flows: advances subscriber sessions, fires
/// scheduled emitters and performs credentialed outbound requests.
#[derive(Parser, Debug)]
#[command(name = "flowbot")]
#[command(version = crate::handlers::VERSION, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a new vault key
    Keygen,

    /// Import a flow definition into the database
    Import {
        /// Path to the flow TOML file
        path: PathBuf,
    },

    /// Send one message to a session and print the bot's replies
    Send {
        /// Bot id (taken from the flow file when --flow is given)
        #[arg(long)]
        bot: Option<BotId>,

        /// Subscriber id (defaults to a fixed CLI subscriber)
        #[arg(long)]
        subscriber: Option<SubscriberId>,

        /// Channel id (defaults to a fixed CLI channel)
        #[arg(long)]
        channel: Option<ChannelId>,

        /// Run against an in-memory copy of this flow instead of the database
        #[arg(long, value_name = "PATH")]
        flow: Option<PathBuf>,

        /// Message text
        text: String,
    },

    /// Run the engine: scheduler plus JSON-lines ingress on stdin
    Serve,

    /// Manage credentials
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Credential management actions
#[derive(Subcommand, Debug)]
pub enum CredentialAction {
    /// Seal and store a credential; the JSON payload is read from stdin
    /// unless --payload is given
    Add {
        #[arg(long)]
        bot: BotId,

        /// Integration provider, e.g. "crm"
        #[arg(long)]
        provider: String,

        /// Auth strategy: bearer, api_key, basic, headers or query
        #[arg(long)]
        strategy: String,

        #[arg(long, default_value = "")]
        label: String,

        /// Granted scope (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,

        /// Make this the default for its (bot, provider, strategy)
        #[arg(long)]
        default: bool,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },

    /// List credential metadata for a bot
    List {
        #[arg(long)]
        bot: BotId,
    },

    /// Make a credential the default of its tuple
    SetDefault {
        id: CredentialId,
    },

    /// Delete a credential
    Delete {
        id: CredentialId,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
}
