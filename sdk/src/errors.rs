//! Error types and handling
//!
//! This module provides the error types used throughout the flow engine.
//! All errors implement the `FlowErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Error messages never carry:
//! - Decrypted credential payloads
//! - Ciphertext or vault key material
//! - Raw upstream response bodies

use thiserror::Error;

/// Trait for flow error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait FlowErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to operators and does not contain
    /// secrets or internal identifiers.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are contained to a single transition and the next
    /// event may succeed. Non-recoverable errors need operator action, such
    /// as fixing the vault key.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration, including the vault key
/// - **Graph**: Unknown steps, ambiguous or invalid connections
/// - **Preset**: Unknown preset type or malformed condition
/// - **Vault**: Credential lookup, resolution and decryption failures
/// - **Request**: Outbound call failures and timeouts
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, FlowErrorExt};
///
/// let error = EngineError::RequestTimeout(30);
/// assert!(error.is_recoverable());
/// assert!(error.routes_to_error_label());
///
/// let fatal = EngineError::Decryption;
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Graph errors
    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Step {0} has several unlabelled outgoing connections")]
    AmbiguousConnection(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Transition exceeded {0} automatic hops")]
    HopLimitExceeded(usize),

    #[error("Session queue closed before {0} was handled")]
    QueueClosed(String),

    // Preset errors
    #[error("Unknown preset type: {0}")]
    UnknownPreset(String),

    #[error("Preset evaluation failed: {0}")]
    PresetEvaluation(String),

    // Vault errors
    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    #[error("No credential resolved for bot {bot}, provider {provider}, strategy {strategy}")]
    CredentialResolutionFailed {
        bot: String,
        provider: String,
        strategy: String,
    },

    #[error("Secret decryption failed")]
    Decryption,

    #[error("Secret encryption failed")]
    Encryption,

    // Request errors
    #[error("Request execution failed: {0}")]
    RequestExecutionFailed(String),

    #[error("Request timed out after {0}s")]
    RequestTimeout(u64),

    // Scheduling
    #[error("Invalid recurrence: {0}")]
    Recurrence(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether a request step may follow its `"error"` connection for this failure
    pub fn routes_to_error_label(&self) -> bool {
        matches!(
            self,
            Self::CredentialNotFound(_)
                | Self::CredentialResolutionFailed { .. }
                | Self::RequestExecutionFailed(_)
                | Self::RequestTimeout(_)
        )
    }
}

impl FlowErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file and vault key",

            // Database errors
            Self::Database(_) => "Database operation failed. Try restarting the engine",

            // Graph errors
            Self::StepNotFound(_) => "The flow references a step that no longer exists",
            Self::AmbiguousConnection(_) => "Label the outgoing connections of this step",
            Self::InvalidGraph(_) => "The flow definition is inconsistent",
            Self::HopLimitExceeded(_) => "The flow loops without waiting for input",
            Self::QueueClosed(_) => "The session worker stopped. Resend the event",

            // Preset errors
            Self::UnknownPreset(_) => "The step uses a preset that is not registered",
            Self::PresetEvaluation(_) => "The step condition is malformed",

            // Vault errors
            Self::CredentialNotFound(_) => "The referenced credential does not exist",
            Self::CredentialResolutionFailed { .. } => {
                "Add a credential or mark one as default for this provider"
            }
            Self::Decryption => "Stored secret could not be decrypted. Check the vault key",
            Self::Encryption => "Secret could not be encrypted",

            // Request errors
            Self::RequestExecutionFailed(_) => "Outbound request failed. Check the endpoint",
            Self::RequestTimeout(_) => "Outbound request took too long. Try again",

            // Scheduling
            Self::Recurrence(_) => "The schedule definition is invalid",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::Decryption | Self::Encryption => false,

            // All other errors are contained to one transition
            _ => true,
        }
    }
}
