/// Session repository
use super::{db_err, from_millis, parse_id, to_millis};
use crate::store::{SessionRecord, SessionStore, StoreResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sdk::types::{BotId, SessionKey, StepId};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the session row unless it exists, then read it back
    ///
    /// Concurrent first contacts race on the primary key; the loser's insert
    /// is ignored and both read the same row.
    pub async fn get_or_create(&self, key: SessionKey, start: StepId) -> Result<SessionRecord> {
        let now = to_millis(Utc::now());

        sqlx::query(
            "INSERT INTO sessions (subscriber_id, bot_id, channel_id, current_step, variables, created_at, updated_at)
             VALUES (?, ?, ?, ?, '{}', ?, ?)
             ON CONFLICT(subscriber_id, bot_id, channel_id) DO NOTHING",
        )
        .bind(key.subscriber.to_string())
        .bind(key.bot.to_string())
        .bind(key.channel.to_string())
        .bind(start.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create session")?;

        self.get(key)
            .await?
            .with_context(|| format!("Session {} vanished after insert", key))
    }

    pub async fn get(&self, key: SessionKey) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT subscriber_id, bot_id, channel_id, current_step, variables, created_at, updated_at
             FROM sessions WHERE subscriber_id = ? AND bot_id = ? AND channel_id = ?",
        )
        .bind(key.subscriber.to_string())
        .bind(key.bot.to_string())
        .bind(key.channel.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session")?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn save(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (subscriber_id, bot_id, channel_id, current_step, variables, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(subscriber_id, bot_id, channel_id) DO UPDATE SET
                current_step = excluded.current_step,
                variables = excluded.variables,
                updated_at = excluded.updated_at",
        )
        .bind(session.key.subscriber.to_string())
        .bind(session.key.bot.to_string())
        .bind(session.key.channel.to_string())
        .bind(session.current_step.to_string())
        .bind(serde_json::to_string(&session.variables)?)
        .bind(to_millis(session.created_at))
        .bind(to_millis(session.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to save session")?;

        Ok(())
    }

    pub async fn keys_for_bot(&self, bot: BotId) -> Result<Vec<SessionKey>> {
        let rows = sqlx::query(
            "SELECT subscriber_id, bot_id, channel_id FROM sessions
             WHERE bot_id = ? ORDER BY created_at, subscriber_id, channel_id",
        )
        .bind(bot.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sessions")?;

        rows.iter().map(key_from_row).collect()
    }
}

fn key_from_row(row: &SqliteRow) -> Result<SessionKey> {
    Ok(SessionKey::new(
        parse_id(&row.try_get::<String, _>("subscriber_id")?)?,
        parse_id(&row.try_get::<String, _>("bot_id")?)?,
        parse_id(&row.try_get::<String, _>("channel_id")?)?,
    ))
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    let variables: String = row.try_get("variables")?;

    Ok(SessionRecord {
        key: key_from_row(row)?,
        current_step: parse_id(&row.try_get::<String, _>("current_step")?)?,
        variables: serde_json::from_str(&variables).context("Invalid session variables")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl SessionStore for SessionRepository {
    async fn get_or_create_session(
        &self,
        key: SessionKey,
        start: StepId,
    ) -> StoreResult<SessionRecord> {
        self.get_or_create(key, start).await.map_err(db_err)
    }

    async fn session(&self, key: SessionKey) -> StoreResult<Option<SessionRecord>> {
        self.get(key).await.map_err(db_err)
    }

    async fn save_session(&self, session: &SessionRecord) -> StoreResult<()> {
        self.save(session).await.map_err(db_err)
    }

    async fn sessions_for_bot(&self, bot: BotId) -> StoreResult<Vec<SessionKey>> {
        self.keys_for_bot(bot).await.map_err(db_err)
    }
}
