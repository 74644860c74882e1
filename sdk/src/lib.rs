//! Flowbot SDK
//!
//! Shared error taxonomy and identity types for the flow engine and the
//! tools built around it.

/// Error types and handling
pub mod errors;

/// Identity and session key types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, FlowErrorExt};
pub use types::{
    labels, BotId, ChannelId, ConnectionId, CredentialId, EmitterId, RecurrenceId, SessionKey,
    StepId, SubscriberId,
};
