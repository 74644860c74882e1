/// Credential repository
///
/// Secrets arrive sealed and are stored as-is. Default changes run in one
/// transaction whose first statement is a write, so concurrent writers queue
/// on the database lock instead of interleaving; the partial unique index
/// rejects anything that slips past.
use super::{db_err, from_millis, parse_id, to_millis};
use crate::store::{CredentialStore, StoreResult};
use crate::vault::CredentialRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sdk::errors::EngineError;
use sdk::types::{BotId, CredentialId};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};

const CREDENTIAL_COLUMNS: &str =
    "id, bot_id, provider, strategy, label, scopes, is_default, secret, created_at, updated_at";

pub struct CredentialRepository {
    pool: SqlitePool,
}

impl CredentialRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &CredentialRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if record.is_default {
            clear_defaults(&mut tx, record).await?;
        }

        sqlx::query(
            "INSERT INTO credentials (id, bot_id, provider, strategy, label, scopes, is_default, secret, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.bot_id.to_string())
        .bind(&record.provider)
        .bind(&record.strategy)
        .bind(&record.label)
        .bind(serde_json::to_string(&record.scopes)?)
        .bind(record.is_default)
        .bind(&record.secret)
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.updated_at))
        .execute(&mut *tx)
        .await
        .context("Failed to insert credential")?;

        tx.commit().await.context("Failed to commit credential")?;
        Ok(())
    }

    /// Replace a credential row. Returns false when it does not exist.
    pub async fn update(&self, record: &CredentialRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if record.is_default {
            clear_defaults(&mut tx, record).await?;
        }

        let result = sqlx::query(
            "UPDATE credentials SET bot_id = ?, provider = ?, strategy = ?, label = ?, scopes = ?,
                is_default = ?, secret = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(record.bot_id.to_string())
        .bind(&record.provider)
        .bind(&record.strategy)
        .bind(&record.label)
        .bind(serde_json::to_string(&record.scopes)?)
        .bind(record.is_default)
        .bind(&record.secret)
        .bind(to_millis(record.updated_at))
        .bind(record.id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to update credential")?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        tx.commit().await.context("Failed to commit credential")?;
        Ok(true)
    }

    /// Make `id` the only default of its tuple. Returns false when it does
    /// not exist.
    pub async fn set_default(&self, id: CredentialId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "UPDATE credentials SET is_default = 0
             WHERE is_default = 1 AND id != ?
               AND (bot_id, provider, strategy) =
                   (SELECT bot_id, provider, strategy FROM credentials WHERE id = ?)",
        )
        .bind(id.to_string())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to clear previous default")?;

        let result = sqlx::query("UPDATE credentials SET is_default = 1, updated_at = ? WHERE id = ?")
            .bind(to_millis(Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to set default credential")?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        tx.commit().await.context("Failed to commit default change")?;
        Ok(true)
    }

    pub async fn remove(&self, id: CredentialId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete credential")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: CredentialId) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE id = ?",
            CREDENTIAL_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch credential")?;

        row.map(|r| credential_from_row(&r)).transpose()
    }

    pub async fn get_default(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credentials
             WHERE bot_id = ? AND provider = ? AND strategy = ? AND is_default = 1",
            CREDENTIAL_COLUMNS
        ))
        .bind(bot.to_string())
        .bind(provider)
        .bind(strategy)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch default credential")?;

        row.map(|r| credential_from_row(&r)).transpose()
    }

    pub async fn list_for_tuple(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> Result<Vec<CredentialRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM credentials
             WHERE bot_id = ? AND provider = ? AND strategy = ?
             ORDER BY id",
            CREDENTIAL_COLUMNS
        ))
        .bind(bot.to_string())
        .bind(provider)
        .bind(strategy)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list credentials")?;

        rows.iter().map(credential_from_row).collect()
    }

    pub async fn list_for_bot(&self, bot: BotId) -> Result<Vec<CredentialRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE bot_id = ? ORDER BY provider, strategy, id",
            CREDENTIAL_COLUMNS
        ))
        .bind(bot.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list credentials")?;

        rows.iter().map(credential_from_row).collect()
    }
}

async fn clear_defaults(
    tx: &mut Transaction<'_, Sqlite>,
    record: &CredentialRecord,
) -> Result<()> {
    sqlx::query(
        "UPDATE credentials SET is_default = 0
         WHERE bot_id = ? AND provider = ? AND strategy = ? AND is_default = 1 AND id != ?",
    )
    .bind(record.bot_id.to_string())
    .bind(&record.provider)
    .bind(&record.strategy)
    .bind(record.id.to_string())
    .execute(&mut **tx)
    .await
    .context("Failed to clear previous default")?;

    Ok(())
}

fn credential_from_row(row: &SqliteRow) -> Result<CredentialRecord> {
    let scopes: String = row.try_get("scopes")?;

    Ok(CredentialRecord {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        bot_id: parse_id(&row.try_get::<String, _>("bot_id")?)?,
        provider: row.try_get("provider")?,
        strategy: row.try_get("strategy")?,
        label: row.try_get("label")?,
        scopes: serde_json::from_str(&scopes).context("Invalid credential scopes")?,
        is_default: row.try_get("is_default")?,
        secret: row.try_get("secret")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl CredentialStore for CredentialRepository {
    async fn insert_credential(&self, record: &CredentialRecord) -> StoreResult<()> {
        self.insert(record).await.map_err(db_err)
    }

    async fn update_credential(&self, record: &CredentialRecord) -> StoreResult<()> {
        if self.update(record).await.map_err(db_err)? {
            Ok(())
        } else {
            Err(EngineError::CredentialNotFound(record.id.to_string()))
        }
    }

    async fn set_default_credential(&self, id: CredentialId) -> StoreResult<()> {
        if self.set_default(id).await.map_err(db_err)? {
            Ok(())
        } else {
            Err(EngineError::CredentialNotFound(id.to_string()))
        }
    }

    async fn delete_credential(&self, id: CredentialId) -> StoreResult<bool> {
        self.remove(id).await.map_err(db_err)
    }

    async fn credential(&self, id: CredentialId) -> StoreResult<Option<CredentialRecord>> {
        self.get(id).await.map_err(db_err)
    }

    async fn default_credential(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> StoreResult<Option<CredentialRecord>> {
        self.get_default(bot, provider, strategy).await.map_err(db_err)
    }

    async fn credentials_for(
        &self,
        bot: BotId,
        provider: &str,
        strategy: &str,
    ) -> StoreResult<Vec<CredentialRecord>> {
        self.list_for_tuple(bot, provider, strategy).await.map_err(db_err)
    }

    async fn credentials_for_bot(&self, bot: BotId) -> StoreResult<Vec<CredentialRecord>> {
        self.list_for_bot(bot).await.map_err(db_err)
    }
}
