//! In-process store
//!
//! Holds every table in memory behind its own `RwLock`. Used by tests and
//! by `flowbot send --dry-run`. Credential default changes happen under a
//! single write guard, so readers never see two defaults for a tuple.

use super::{
    BotRecord, CredentialStore, EmitterStore, GraphStore, SessionRecord, SessionStore,
    StoreResult,
};
use crate::graph::{Connection, Step, StepGraph};
use crate::scheduler::{Emitter, RecurrenceSpec};
use crate::vault::CredentialRecord;
use async_trait::async_trait;
use chrono::Utc;
use sdk::errors::EngineError;
use sdk::types::{
    BotId, ConnectionId, CredentialId, EmitterId, RecurrenceId, SessionKey, StepId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

/// Tables are locked in declaration order whenever a call needs more than one
#[derive(Debug, Default)]
pub struct MemoryStore {
    bots: RwLock<HashMap<BotId, BotRecord>>,
    steps: RwLock<BTreeMap<StepId, Step>>,
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
    sessions: RwLock<BTreeMap<SessionKey, SessionRecord>>,
    emitters: RwLock<BTreeMap<EmitterId, Emitter>>,
    recurrences: RwLock<HashMap<RecurrenceId, RecurrenceSpec>>,
    credentials: RwLock<BTreeMap<CredentialId, CredentialRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn same_tuple(a: &CredentialRecord, b: &CredentialRecord) -> bool {
    a.bot_id == b.bot_id && a.provider == b.provider && a.strategy == b.strategy
}

fn clear_other_defaults(table: &mut BTreeMap<CredentialId, CredentialRecord>, winner: &CredentialRecord) {
    for other in table.values_mut() {
        if other.id != winner.id && same_tuple(other, winner) {
            other.is_default = false;
        }
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn bot(&self, id: BotId) -> StoreResult<Option<BotRecord>> {
        Ok(self.bots.read().await.get(&id).cloned())
    }

    async fn upsert_bot(&self, bot: &BotRecord) -> StoreResult<()> {
        self.bots.write().await.insert(bot.id, bot.clone());
        Ok(())
    }

    async fn upsert_step(&self, step: &Step) -> StoreResult<()> {
        self.steps.write().await.insert(step.id, step.clone());
        Ok(())
    }

    async fn delete_step(&self, id: StepId) -> StoreResult<bool> {
        let mut bots = self.bots.write().await;
        let mut steps = self.steps.write().await;
        let mut connections = self.connections.write().await;

        let Some(step) = steps.remove(&id) else {
            return Ok(false);
        };
        connections.retain(|_, c| c.source != id && c.target != id);
        if let Some(bot) = bots.get_mut(&step.bot_id) {
            bot.global_connections.retain(|g| g.target != id);
        }
        Ok(true)
    }

    async fn upsert_connection(&self, connection: &Connection) -> StoreResult<()> {
        self.connections
            .write()
            .await
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn delete_connection(&self, id: ConnectionId) -> StoreResult<bool> {
        Ok(self.connections.write().await.remove(&id).is_some())
    }

    async fn load_graph(&self, bot: BotId) -> StoreResult<StepGraph> {
        // One snapshot across the three tables
        let bots = self.bots.read().await;
        let steps = self.steps.read().await;
        let connections = self.connections.read().await;

        let record = bots.get(&bot);
        let start = record.and_then(|b| b.start_step);
        let globals = record
            .map(|b| b.global_connections.clone())
            .unwrap_or_default();

        let steps: Vec<Step> = steps
            .values()
            .filter(|s| s.bot_id == bot)
            .cloned()
            .collect();
        let ids: HashSet<StepId> = steps.iter().map(|s| s.id).collect();
        let connections: Vec<Connection> = connections
            .values()
            .filter(|c| ids.contains(&c.source))
            .cloned()
            .collect();

        StepGraph::build(bot, start, steps, connections)?.with_global_connections(globals)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_or_create_session(
        &self,
        key: SessionKey,
        start: StepId,
    ) -> StoreResult<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(key)
            .or_insert_with(|| SessionRecord::new(key, start))
            .clone())
    }

    async fn session(&self, key: SessionKey) -> StoreResult<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(&key).cloned())
    }

    async fn save_session(&self, session: &SessionRecord) -> StoreResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.key, session.clone());
        Ok(())
    }

    async fn sessions_for_bot(&self, bot: BotId) -> StoreResult<Vec<SessionKey>> {
        Ok(self
            .sessions
            .read()
            .await
            .keys()
            .filter(|k| k.bot == bot)
            .copied()
            .collect())
    }
}

#[async_trait]
impl EmitterStore for MemoryStore {
    async fn emitter_by_job(&self, job_id: &str) -> StoreResult<Option<Emitter>> {
        Ok(self
            .emitters
            .read()
            .await
            .values()
            .find(|e| e.job_id == job_id)
            .cloned())
    }

    async fn emitters(&self) -> StoreResult<Vec<Emitter>> {
        Ok(self.emitters.read().await.values().cloned().collect())
    }

    async fn upsert_emitter(&self, emitter: &Emitter) -> StoreResult<()> {
        let mut emitters = self.emitters.write().await;
        if emitters
            .values()
            .any(|e| e.id != emitter.id && e.job_id == emitter.job_id)
        {
            return Err(EngineError::Database(format!(
                "job id '{}' is already bound to another emitter",
                emitter.job_id
            )));
        }
        emitters.insert(emitter.id, emitter.clone());
        Ok(())
    }

    async fn delete_emitter(&self, id: EmitterId) -> StoreResult<bool> {
        Ok(self.emitters.write().await.remove(&id).is_some())
    }

    async fn set_emitter_active(&self, id: EmitterId, active: bool) -> StoreResult<()> {
        if let Some(emitter) = self.emitters.write().await.get_mut(&id) {
            emitter.is_active = active;
        }
        Ok(())
    }

    async fn recurrence(&self, id: RecurrenceId) -> StoreResult<Option<RecurrenceSpec>> {
        Ok(self.recurrences.read().await.get(&id).cloned())
    }

    async fn upsert_recurrence(&self, spec: &RecurrenceSpec) -> StoreResult<()> {
        self.recurrences.write().await.insert(spec.id, spec.clone());
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_credential(&self, record: &CredentialRecord) -> StoreResult<()> {
        let mut credentials = self.credentials.write().await;
        if credentials.contains_key(&record.id) {
            return Err(EngineError::Database(format!(
                "credential {} already exists",
                record.id
            )));
        }
        if record.is_default {
            clear_other_defaults(&mut credentials, record);
        }
        credentials.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_credential(&self, record: &CredentialRecord) -> StoreResult<()> {
        let mut credentials = self.credentials.write().await;
        if !credentials.contains_key(&record.id) {
            return Err(EngineError::CredentialNotFound(record.id.to_string()));
        }
        if record.is_default {
            clear_other_defaults(&mut credentials, record);
        }
        credentials.insert(record.id, record.clone());
        Ok(())
    }

    async fn set_default_credential(&self, id: CredentialId) -> StoreResult<()> {
        let mut credentials = self.credentials.write().await;
        let winner = credentials
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::CredentialNotFound(id.to_string()))?;

        clear_other_defaults(&mut credentials, &winner);
        if let Some(record) = credentials.get_mut(&id) {
            record.is_default = true;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_credential(&self, id: CredentialId) -> StoreResult<bool> {
        Ok(self.credentials.write().await.remove(&id).is_some())
    }

    async fn credential(&self, id: CredentialId) -> StoreResult<Option<CredentialRecord>> {
        Ok(self.credentials.read().await.get(&id).cloned())
    }

    async fn default_credential(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> StoreResult<Option<CredentialRecord>> {
        Ok(self
            .credentials
            .read()
            .await
            .values()
            .find(|c| {
                c.is_default && c.bot_id == bot && c.provider == provider && c.strategy == strategy
            })
            .cloned())
    }

    async fn credentials_for(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> StoreResult<Vec<CredentialRecord>> {
        Ok(self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.bot_id == bot && c.provider == provider && c.strategy == strategy)
            .cloned()
            .collect())
    }

    async fn credentials_for_bot(&self, bot: BotId) -> StoreResult<Vec<CredentialRecord>> {
        Ok(self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.bot_id == bot)
            .cloned()
            .collect())
    }
}
