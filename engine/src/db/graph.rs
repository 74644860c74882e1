/// Bot, step and connection repository
///
/// Upserts use `ON CONFLICT DO UPDATE` rather than `REPLACE`: a replaced step
/// row would cascade-delete its connections.
use super::{db_err, parse_id};
use crate::graph::{Connection, GlobalConnection, Position, Step, StepGraph, StepKind};
use crate::store::{BotRecord, GraphStore, StoreResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::types::{BotId, ConnectionId, StepId};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;

/// Repository for bots and their step graphs
pub struct GraphRepository {
    pool: SqlitePool,
}

impl GraphRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_bot(&self, id: BotId) -> Result<Option<BotRecord>> {
        let row = sqlx::query("SELECT id, name, start_step, variables FROM bots WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch bot")?;

        let Some(mut bot) = row.map(|r| bot_from_row(&r)).transpose()? else {
            return Ok(None);
        };
        bot.global_connections = self.global_connections(id).await?;
        Ok(Some(bot))
    }

    pub async fn list_bots(&self) -> Result<Vec<BotRecord>> {
        let rows = sqlx::query("SELECT id, name, start_step, variables FROM bots ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list bots")?;

        let mut bots = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut bot = bot_from_row(row)?;
            bot.global_connections = self.global_connections(bot.id).await?;
            bots.push(bot);
        }
        Ok(bots)
    }

    pub async fn global_connections(&self, bot: BotId) -> Result<Vec<GlobalConnection>> {
        let rows = sqlx::query(
            "SELECT label, target FROM global_connections WHERE bot_id = ? ORDER BY sort_order, label",
        )
        .bind(bot.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch global connections")?;

        rows.iter()
            .map(|row| {
                Ok(GlobalConnection {
                    label: row.try_get("label")?,
                    target: parse_id(&row.try_get::<String, _>("target")?)?,
                })
            })
            .collect()
    }

    /// Upsert the bot row and replace its global connections
    pub async fn save_bot(&self, bot: &BotRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "INSERT INTO bots (id, name, start_step, variables) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                start_step = excluded.start_step,
                variables = excluded.variables",
        )
        .bind(bot.id.to_string())
        .bind(&bot.name)
        .bind(bot.start_step.map(|s| s.to_string()))
        .bind(serde_json::to_string(&bot.variables)?)
        .execute(&mut *tx)
        .await
        .context("Failed to save bot")?;

        sqlx::query("DELETE FROM global_connections WHERE bot_id = ?")
            .bind(bot.id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to clear global connections")?;

        for (order, global) in bot.global_connections.iter().enumerate() {
            sqlx::query(
                "INSERT INTO global_connections (bot_id, label, target, sort_order) VALUES (?, ?, ?, ?)",
            )
            .bind(bot.id.to_string())
            .bind(&global.label)
            .bind(global.target.to_string())
            .bind(order as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to save global connection")?;
        }

        tx.commit().await.context("Failed to commit bot")?;
        Ok(())
    }

    pub async fn save_step(&self, step: &Step) -> Result<()> {
        sqlx::query(
            "INSERT INTO steps (id, bot_id, name, kind, timeout_secs, message, save, terminal, pos_x, pos_y)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                bot_id = excluded.bot_id,
                name = excluded.name,
                kind = excluded.kind,
                timeout_secs = excluded.timeout_secs,
                message = excluded.message,
                save = excluded.save,
                terminal = excluded.terminal,
                pos_x = excluded.pos_x,
                pos_y = excluded.pos_y",
        )
        .bind(step.id.to_string())
        .bind(step.bot_id.to_string())
        .bind(&step.name)
        .bind(serde_json::to_string(&step.kind)?)
        .bind(step.timeout_secs.map(|t| t as i64))
        .bind(step.message.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&step.save)?)
        .bind(step.terminal)
        .bind(step.position.map(|p| p.x))
        .bind(step.position.map(|p| p.y))
        .execute(&self.pool)
        .await
        .context("Failed to save step")?;

        Ok(())
    }

    /// Delete a step; its connections go with it through the foreign keys
    pub async fn remove_step(&self, id: StepId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM global_connections WHERE target = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete global connections")?;

        let result = sqlx::query("DELETE FROM steps WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete step")?;

        tx.commit().await.context("Failed to commit step removal")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn save_connection(&self, connection: &Connection) -> Result<()> {
        sqlx::query(
            "INSERT INTO connections (id, source, target, label, sort_order) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                target = excluded.target,
                label = excluded.label,
                sort_order = excluded.sort_order",
        )
        .bind(connection.id.to_string())
        .bind(connection.source.to_string())
        .bind(connection.target.to_string())
        .bind(connection.label.as_deref())
        .bind(connection.order)
        .execute(&self.pool)
        .await
        .context("Failed to save connection")?;

        Ok(())
    }

    pub async fn remove_connection(&self, id: ConnectionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete connection")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn steps_for_bot(&self, bot: BotId) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, bot_id, name, kind, timeout_secs, message, save, terminal, pos_x, pos_y
             FROM steps WHERE bot_id = ? ORDER BY name",
        )
        .bind(bot.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch steps")?;

        rows.iter().map(step_from_row).collect()
    }

    pub async fn connections_for_bot(&self, bot: BotId) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT c.id, c.source, c.target, c.label, c.sort_order
             FROM connections c JOIN steps s ON s.id = c.source
             WHERE s.bot_id = ?
             ORDER BY c.source, c.sort_order",
        )
        .bind(bot.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch connections")?;

        rows.iter().map(connection_from_row).collect()
    }
}

fn bot_from_row(row: &SqliteRow) -> Result<BotRecord> {
    let start_step: Option<String> = row.try_get("start_step")?;
    let variables: String = row.try_get("variables")?;

    Ok(BotRecord {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        name: row.try_get("name")?,
        start_step: start_step.as_deref().map(parse_id).transpose()?,
        variables: serde_json::from_str(&variables).context("Invalid bot variables")?,
        global_connections: Vec::new(),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<Step> {
    let kind: String = row.try_get("kind")?;
    let message: Option<String> = row.try_get("message")?;
    let save: String = row.try_get("save")?;
    let timeout_secs: Option<i64> = row.try_get("timeout_secs")?;
    let pos_x: Option<f64> = row.try_get("pos_x")?;
    let pos_y: Option<f64> = row.try_get("pos_y")?;

    let kind: StepKind = serde_json::from_str(&kind).context("Invalid step kind")?;
    let save: BTreeMap<String, String> =
        serde_json::from_str(&save).context("Invalid step save mappings")?;

    Ok(Step {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        bot_id: parse_id(&row.try_get::<String, _>("bot_id")?)?,
        name: row.try_get("name")?,
        kind,
        timeout_secs: timeout_secs.map(|t| t.max(0) as u64),
        message: message
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Invalid step message")?,
        save,
        terminal: row.try_get("terminal")?,
        position: pos_x.zip(pos_y).map(|(x, y)| Position { x, y }),
    })
}

fn connection_from_row(row: &SqliteRow) -> Result<Connection> {
    Ok(Connection {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        source: parse_id(&row.try_get::<String, _>("source")?)?,
        target: parse_id(&row.try_get::<String, _>("target")?)?,
        label: row.try_get("label")?,
        order: row.try_get("sort_order")?,
    })
}

#[async_trait]
impl GraphStore for GraphRepository {
    async fn bot(&self, id: BotId) -> StoreResult<Option<BotRecord>> {
        self.get_bot(id).await.map_err(db_err)
    }

    async fn upsert_bot(&self, bot: &BotRecord) -> StoreResult<()> {
        self.save_bot(bot).await.map_err(db_err)
    }

    async fn upsert_step(&self, step: &Step) -> StoreResult<()> {
        self.save_step(step).await.map_err(db_err)
    }

    async fn delete_step(&self, id: StepId) -> StoreResult<bool> {
        self.remove_step(id).await.map_err(db_err)
    }

    async fn upsert_connection(&self, connection: &Connection) -> StoreResult<()> {
        self.save_connection(connection).await.map_err(db_err)
    }

    async fn delete_connection(&self, id: ConnectionId) -> StoreResult<bool> {
        self.remove_connection(id).await.map_err(db_err)
    }

    async fn load_graph(&self, bot: BotId) -> StoreResult<StepGraph> {
        let record = self.get_bot(bot).await.map_err(db_err)?;
        let start = record.as_ref().and_then(|b| b.start_step);
        let globals = record.map(|b| b.global_connections).unwrap_or_default();
        let steps = self.steps_for_bot(bot).await.map_err(db_err)?;
        let connections = self.connections_for_bot(bot).await.map_err(db_err)?;

        StepGraph::build(bot, start, steps, connections)?.with_global_connections(globals)
    }
}
