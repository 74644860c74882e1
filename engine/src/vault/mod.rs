//! Credential vault
//!
//! Per-bot integration secrets are stored only as sealed blobs (see
//! [`crate::crypto`]). The vault is the one place that seals and opens
//! them; plaintext leaves it only inside a [`ResolvedCredential`].
//!
//! # Resolution order
//!
//! Given `(bot, provider, strategy, explicit id?)`:
//!
//! 1. An explicit id returns that credential or `CredentialNotFound`
//! 2. Otherwise the default credential of the tuple
//! 3. Otherwise the tuple's only credential, if there is exactly one
//! 4. Otherwise `CredentialResolutionFailed`
//!
//! The order never depends on creation time or row order.

pub mod auth;

use crate::crypto::SecretBox;
use crate::secrets::SecretValue;
use crate::store::CredentialStore;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::{BotId, CredentialId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stored form of a credential; `secret` is a sealed blob
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub bot_id: BotId,
    pub provider: String,
    pub strategy: String,
    pub label: String,
    pub scopes: Vec<String>,
    pub is_default: bool,
    pub secret: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credential metadata safe to list and display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialInfo {
    pub id: CredentialId,
    pub bot_id: BotId,
    pub provider: String,
    pub strategy: String,
    pub label: String,
    pub scopes: Vec<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&CredentialRecord> for CredentialInfo {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            id: record.id,
            bot_id: record.bot_id,
            provider: record.provider.clone(),
            strategy: record.strategy.clone(),
            label: record.label.clone(),
            scopes: record.scopes.clone(),
            is_default: record.is_default,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Input for [`CredentialVault::create`]
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub bot_id: BotId,
    pub provider: String,
    pub strategy: String,
    pub label: String,
    pub scopes: Vec<String>,
    pub is_default: bool,
    pub payload: SecretValue,
}

/// Partial update for [`CredentialVault::update`]
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub label: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub is_default: Option<bool>,
    pub payload: Option<SecretValue>,
}

/// Credential reference carried by request steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub provider: String,
    pub strategy: String,
    #[serde(default)]
    pub id: Option<CredentialId>,
}

/// A credential with its opened payload
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub id: CredentialId,
    pub provider: String,
    pub strategy: String,
    pub scopes: Vec<String>,
    pub payload: SecretValue,
}

/// Seals, stores and resolves credentials
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    secret_box: Arc<SecretBox>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>, secret_box: Arc<SecretBox>) -> Self {
        Self { store, secret_box }
    }

    /// Seal and store a new credential
    pub async fn create(&self, input: NewCredential) -> Result<CredentialInfo, EngineError> {
        if input.provider.trim().is_empty() || input.strategy.trim().is_empty() {
            return Err(EngineError::Config(
                "credential provider and strategy must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let record = CredentialRecord {
            id: CredentialId::new(),
            bot_id: input.bot_id,
            provider: input.provider,
            strategy: input.strategy,
            label: input.label,
            scopes: input.scopes,
            is_default: input.is_default,
            secret: self.secret_box.seal(input.payload.expose())?,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_credential(&record).await?;
        tracing::info!(
            credential = %record.id,
            bot = %record.bot_id,
            provider = %record.provider,
            strategy = %record.strategy,
            is_default = record.is_default,
            "Credential stored"
        );

        Ok(CredentialInfo::from(&record))
    }

    /// Apply a partial update; a new payload is re-sealed with a fresh nonce
    pub async fn update(
        &self,
        id: CredentialId,
        update: CredentialUpdate,
    ) -> Result<CredentialInfo, EngineError> {
        let mut record = self
            .store
            .credential(id)
            .await?
            .ok_or_else(|| EngineError::CredentialNotFound(id.to_string()))?;

        if let Some(label) = update.label {
            record.label = label;
        }
        if let Some(scopes) = update.scopes {
            record.scopes = scopes;
        }
        if let Some(is_default) = update.is_default {
            record.is_default = is_default;
        }
        if let Some(payload) = update.payload {
            record.secret = self.secret_box.seal(payload.expose())?;
        }
        record.updated_at = Utc::now();

        self.store.update_credential(&record).await?;
        tracing::info!(credential = %id, "Credential updated");

        Ok(CredentialInfo::from(&record))
    }

    /// Make `id` the default of its (bot, provider, strategy) tuple
    pub async fn set_default(&self, id: CredentialId) -> Result<(), EngineError> {
        self.store.set_default_credential(id).await?;
        tracing::info!(credential = %id, "Credential marked default");
        Ok(())
    }

    pub async fn delete(&self, id: CredentialId) -> Result<bool, EngineError> {
        let removed = self.store.delete_credential(id).await?;
        if removed {
            tracing::info!(credential = %id, "Credential deleted");
        }
        Ok(removed)
    }

    /// Metadata of every credential of a bot
    pub async fn list(&self, bot: BotId) -> Result<Vec<CredentialInfo>, EngineError> {
        let records = self.store.credentials_for_bot(bot).await?;
        Ok(records.iter().map(CredentialInfo::from).collect())
    }

    /// Resolve and open a credential.
    ///
    /// # Errors
    ///
    /// - `CredentialNotFound` for an unknown explicit id, or one owned by another bot
    /// - `CredentialResolutionFailed` when no default exists and the tuple
    ///   does not hold exactly one credential
    /// - `Decryption` when the stored blob cannot be opened
    pub async fn resolve(
        &self,
        bot: BotId,
        reference: &CredentialRef,
    ) -> Result<ResolvedCredential, EngineError> {
        let record = self.select(bot, reference).await?;
        let payload = self.secret_box.open(&record.secret).map_err(|e| {
            tracing::error!(credential = %record.id, bot = %bot, "Credential could not be decrypted");
            e
        })?;

        Ok(ResolvedCredential {
            id: record.id,
            provider: record.provider,
            strategy: record.strategy,
            scopes: record.scopes,
            payload: SecretValue::new(payload),
        })
    }

    async fn select(
        &self,
        bot: BotId,
        reference: &CredentialRef,
    ) -> Result<CredentialRecord, EngineError> {
        if let Some(id) = reference.id {
            return match self.store.credential(id).await? {
                Some(record) if record.bot_id == bot => {
                    tracing::debug!(credential = %id, "Credential resolved by explicit id");
                    Ok(record)
                }
                _ => Err(EngineError::CredentialNotFound(id.to_string())),
            };
        }

        if let Some(record) = self
            .store
            .default_credential(bot, &reference.provider, &reference.strategy)
            .await?
        {
            tracing::debug!(credential = %record.id, "Credential resolved as default");
            return Ok(record);
        }

        let mut candidates = self
            .store
            .credentials_for(bot, &reference.provider, &reference.strategy)
            .await?;
        if candidates.len() == 1 {
            if let Some(record) = candidates.pop() {
                tracing::debug!(credential = %record.id, "Credential resolved as singleton");
                return Ok(record);
            }
        }

        tracing::warn!(
            bot = %bot,
            provider = %reference.provider,
            strategy = %reference.strategy,
            candidates = candidates.len(),
            "Credential resolution failed"
        );
        Err(EngineError::CredentialResolutionFailed {
            bot: bot.to_string(),
            provider: reference.provider.clone(),
            strategy: reference.strategy.clone(),
        })
    }
}
