/// Emitter and recurrence repository
use super::{db_err, parse_id};
use crate::scheduler::{Emitter, EmitterAudience, RecurrenceSpec};
use crate::store::{EmitterStore, StoreResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::types::{EmitterId, RecurrenceId};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

const EMITTER_COLUMNS: &str = "id, bot_id, name, target_step, job_id, recurrence_id, message, \
                               needs_message_processing, audience, is_active";

pub struct EmitterRepository {
    pool: SqlitePool,
}

impl EmitterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_job(&self, job_id: &str) -> Result<Option<Emitter>> {
        let row = sqlx::query(&format!("SELECT {} FROM emitters WHERE job_id = ?", EMITTER_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch emitter")?;

        row.map(|r| emitter_from_row(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Emitter>> {
        let rows = sqlx::query(&format!("SELECT {} FROM emitters ORDER BY job_id", EMITTER_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list emitters")?;

        rows.iter().map(emitter_from_row).collect()
    }

    /// Insert or update an emitter; a job id bound to another emitter fails
    /// on the unique constraint
    pub async fn save(&self, emitter: &Emitter) -> Result<()> {
        sqlx::query(
            "INSERT INTO emitters (id, bot_id, name, target_step, job_id, recurrence_id, message,
                                   needs_message_processing, audience, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                bot_id = excluded.bot_id,
                name = excluded.name,
                target_step = excluded.target_step,
                job_id = excluded.job_id,
                recurrence_id = excluded.recurrence_id,
                message = excluded.message,
                needs_message_processing = excluded.needs_message_processing,
                audience = excluded.audience,
                is_active = excluded.is_active",
        )
        .bind(emitter.id.to_string())
        .bind(emitter.bot_id.to_string())
        .bind(&emitter.name)
        .bind(emitter.target_step.map(|s| s.to_string()))
        .bind(&emitter.job_id)
        .bind(emitter.recurrence.map(|r| r.to_string()))
        .bind(emitter.message.as_ref().map(serde_json::to_string).transpose()?)
        .bind(emitter.needs_message_processing)
        .bind(serde_json::to_string(&emitter.audience)?)
        .bind(emitter.is_active)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save emitter for job '{}'", emitter.job_id))?;

        Ok(())
    }

    pub async fn remove(&self, id: EmitterId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM emitters WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete emitter")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_active(&self, id: EmitterId, active: bool) -> Result<()> {
        sqlx::query("UPDATE emitters SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update emitter state")?;

        Ok(())
    }

    pub async fn get_recurrence(&self, id: RecurrenceId) -> Result<Option<RecurrenceSpec>> {
        let spec: Option<String> = sqlx::query_scalar("SELECT spec FROM recurrences WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch recurrence")?;

        spec.map(|s| serde_json::from_str(&s).context("Invalid recurrence spec"))
            .transpose()
    }

    pub async fn save_recurrence(&self, spec: &RecurrenceSpec) -> Result<()> {
        sqlx::query(
            "INSERT INTO recurrences (id, spec) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET spec = excluded.spec",
        )
        .bind(spec.id.to_string())
        .bind(serde_json::to_string(spec)?)
        .execute(&self.pool)
        .await
        .context("Failed to save recurrence")?;

        Ok(())
    }
}

fn emitter_from_row(row: &SqliteRow) -> Result<Emitter> {
    let target_step: Option<String> = row.try_get("target_step")?;
    let recurrence: Option<String> = row.try_get("recurrence_id")?;
    let message: Option<String> = row.try_get("message")?;
    let audience: String = row.try_get("audience")?;
    let audience: EmitterAudience =
        serde_json::from_str(&audience).context("Invalid emitter audience")?;

    Ok(Emitter {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        bot_id: parse_id(&row.try_get::<String, _>("bot_id")?)?,
        name: row.try_get("name")?,
        target_step: target_step.as_deref().map(parse_id).transpose()?,
        job_id: row.try_get("job_id")?,
        recurrence: recurrence.as_deref().map(parse_id).transpose()?,
        message: message
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Invalid emitter message")?,
        needs_message_processing: row.try_get("needs_message_processing")?,
        audience,
        is_active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl EmitterStore for EmitterRepository {
    async fn emitter_by_job(&self, job_id: &str) -> StoreResult<Option<Emitter>> {
        self.get_by_job(job_id).await.map_err(db_err)
    }

    async fn emitters(&self) -> StoreResult<Vec<Emitter>> {
        self.list().await.map_err(db_err)
    }

    async fn upsert_emitter(&self, emitter: &Emitter) -> StoreResult<()> {
        self.save(emitter).await.map_err(db_err)
    }

    async fn delete_emitter(&self, id: EmitterId) -> StoreResult<bool> {
        self.remove(id).await.map_err(db_err)
    }

    async fn set_emitter_active(&self, id: EmitterId, active: bool) -> StoreResult<()> {
        self.set_active(id, active).await.map_err(db_err)
    }

    async fn recurrence(&self, id: RecurrenceId) -> StoreResult<Option<RecurrenceSpec>> {
        self.get_recurrence(id).await.map_err(db_err)
    }

    async fn upsert_recurrence(&self, spec: &RecurrenceSpec) -> StoreResult<()> {
        self.save_recurrence(spec).await.map_err(db_err)
    }
}
