/// Database module for SQLite persistence
///
/// This module implements the persistence collaborator over SQLite: bots,
/// steps and connections, sessions, emitters and recurrences, and sealed
/// credentials. It uses sqlx with WAL mode for better concurrency.
///
/// Each repository offers `anyhow`-based inherent methods and implements the
/// matching trait from [`crate::store`], mapping failures to
/// `EngineError::Database`.
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sdk::errors::EngineError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub mod credentials;
pub mod emitters;
pub mod graph;
pub mod sessions;

// Re-export commonly used types
pub use credentials::CredentialRepository;
pub use emitters::EmitterRepository;
pub use graph::GraphRepository;
pub use sessions::SessionRepository;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode and foreign keys
    /// 3. Run migrations to set up the schema
    ///
    /// SQLite recovers from an unclean shutdown by replaying the WAL when the
    /// database is reopened. During graceful shutdown, call `close()` to
    /// checkpoint the WAL into the main database file.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        // Configure SQLite connection with WAL mode
        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();

        // Create connection pool
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations use `IF NOT EXISTS` and can be run multiple times safely.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Close the database connection
    ///
    /// This flushes the WAL and closes all connections in the pool.
    pub async fn close(self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    /// Create a bot/step/connection repository
    pub fn graphs(&self) -> GraphRepository {
        GraphRepository::new(self.pool.clone())
    }

    /// Create a session repository
    pub fn sessions(&self) -> SessionRepository {
        SessionRepository::new(self.pool.clone())
    }

    /// Create an emitter/recurrence repository
    pub fn emitters(&self) -> EmitterRepository {
        EmitterRepository::new(self.pool.clone())
    }

    /// Create a credential repository
    pub fn credentials(&self) -> CredentialRepository {
        CredentialRepository::new(self.pool.clone())
    }
}

/// Map a repository failure into the engine taxonomy
pub(crate) fn db_err(error: anyhow::Error) -> EngineError {
    EngineError::Database(format!("{:#}", error))
}

/// Parse a stored UUID column into an id newtype
pub(crate) fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = uuid::Error>,
{
    T::from_str(raw).with_context(|| format!("Invalid id in database: {}", raw))
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Invalid timestamp in database: {}", ms))
}
