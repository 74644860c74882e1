//! Persistence collaborator interfaces
//!
//! The engine reads and writes flows, sessions, emitters and credentials
//! only through these traits. Two implementations ship with the crate:
//! [`memory::MemoryStore`] (in-process, used by tests and `flowbot send`
//! dry runs) and the SQLite repositories in [`crate::db`].
//!
//! Implementations must treat each call as its own unit of work. The only
//! multi-row atomicity the engine relies on is in
//! [`CredentialStore::set_default_credential`] and the default handling of
//! insert/update, which must clear any other default for the same
//! (bot, provider, strategy) tuple in the same atomic step.

pub mod memory;

use crate::graph::{Connection, GlobalConnection, Step, StepGraph};
use crate::scheduler::{Emitter, RecurrenceSpec};
use crate::vault::CredentialRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::{
    BotId, ConnectionId, CredentialId, EmitterId, RecurrenceId, SessionKey, StepId,
};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;

/// Result type for persistence calls
pub type StoreResult<T> = std::result::Result<T, EngineError>;

/// A bot: owner of a step graph and of bot-level variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
    pub id: BotId,
    pub name: String,
    /// Where new sessions begin and dead ends re-enter
    pub start_step: Option<StepId>,
    #[serde(default = "empty_object")]
    pub variables: serde_json::Value,
    /// Checked on every inbound message before the current step's connections
    #[serde(default)]
    pub global_connections: Vec<GlobalConnection>,
}

/// Persisted state of one (subscriber, bot, channel) session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub current_step: StepId,
    pub variables: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(key: SessionKey, current_step: StepId) -> Self {
        let now = Utc::now();
        Self {
            key,
            current_step,
            variables: empty_object(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub(crate) fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Bots, steps and connections
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn bot(&self, id: BotId) -> StoreResult<Option<BotRecord>>;
    async fn upsert_bot(&self, bot: &BotRecord) -> StoreResult<()>;

    async fn upsert_step(&self, step: &Step) -> StoreResult<()>;
    async fn delete_step(&self, id: StepId) -> StoreResult<bool>;

    async fn upsert_connection(&self, connection: &Connection) -> StoreResult<()>;
    async fn delete_connection(&self, id: ConnectionId) -> StoreResult<bool>;

    /// Load the full graph of a bot.
    ///
    /// # Errors
    ///
    /// `StepNotFound` style lookups are left to the caller; this fails with
    /// `InvalidGraph` when the stored rows violate graph invariants and with
    /// `Database` on storage failure.
    async fn load_graph(&self, bot: BotId) -> StoreResult<StepGraph>;
}

/// Session pointers and session variables
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the session, creating it at `start` on first contact
    async fn get_or_create_session(&self, key: SessionKey, start: StepId)
        -> StoreResult<SessionRecord>;

    async fn session(&self, key: SessionKey) -> StoreResult<Option<SessionRecord>>;

    /// Persist the step pointer and variables of a committed transition
    async fn save_session(&self, session: &SessionRecord) -> StoreResult<()>;

    /// Every session of a bot, in a stable order
    async fn sessions_for_bot(&self, bot: BotId) -> StoreResult<Vec<SessionKey>>;
}

/// Emitters and recurrence specs
#[async_trait]
pub trait EmitterStore: Send + Sync {
    async fn emitter_by_job(&self, job_id: &str) -> StoreResult<Option<Emitter>>;
    async fn emitters(&self) -> StoreResult<Vec<Emitter>>;
    async fn upsert_emitter(&self, emitter: &Emitter) -> StoreResult<()>;
    async fn delete_emitter(&self, id: EmitterId) -> StoreResult<bool>;
    async fn set_emitter_active(&self, id: EmitterId, active: bool) -> StoreResult<()>;

    async fn recurrence(&self, id: RecurrenceId) -> StoreResult<Option<RecurrenceSpec>>;
    async fn upsert_recurrence(&self, spec: &RecurrenceSpec) -> StoreResult<()>;
}

/// Encrypted credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a credential. When `record.is_default` is set, any other
    /// default for the same tuple is cleared atomically with the insert.
    async fn insert_credential(&self, record: &CredentialRecord) -> StoreResult<()>;

    /// Replace a credential, with the same default handling as insert
    async fn update_credential(&self, record: &CredentialRecord) -> StoreResult<()>;

    /// Flag `id` as the default of its tuple and clear every other default,
    /// in one atomic step
    async fn set_default_credential(&self, id: CredentialId) -> StoreResult<()>;

    async fn delete_credential(&self, id: CredentialId) -> StoreResult<bool>;

    async fn credential(&self, id: CredentialId) -> StoreResult<Option<CredentialRecord>>;

    async fn default_credential(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> StoreResult<Option<CredentialRecord>>;

    /// All credentials of a tuple, default or not
    async fn credentials_for(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> StoreResult<Vec<CredentialRecord>>;

    async fn credentials_for_bot(&self, bot: BotId) -> StoreResult<Vec<CredentialRecord>>;
}
