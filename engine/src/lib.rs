//! Flowbot Engine Library
//!
//! This library provides the core functionality of the flowbot engine:
//! step graphs, the session state machine, presets, emitter scheduling,
//! the credential vault and the request executor.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Cryptographic operations module
pub mod crypto;

/// Secret scrubbing and secret value wrappers
pub mod secrets;

/// Database persistence module
pub mod db;

/// Persistence collaborator traits and the in-memory store
pub mod store;

/// Message bus for outbound notifications
pub mod message_bus;

/// Step graph and flow definitions
pub mod graph;

/// Session state machine
pub mod session;

/// Preset evaluators for conditional steps
pub mod preset;

/// Emitter scheduler and cron driver
pub mod scheduler;

/// Credential vault
pub mod vault;

/// Outbound request executor
pub mod request;

/// Variable paths and save mappings
pub mod variables;

/// Placeholder templating
pub mod template;

/// Telemetry and Observability
pub mod telemetry;

/// Engine assembly and serve loop
pub mod daemon;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
