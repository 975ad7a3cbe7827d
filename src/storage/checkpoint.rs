//! SQLite checkpoint store for resumable builds.
//!
//! One row per build key holds the serialized [`PipelineState`] after the
//! last completed stage. Saving replaces the previous row.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::PipelineState;

/// In-memory database URL, used by tests.
pub const MEMORY_DATABASE: &str = "sqlite::memory:";

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Connection or query failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// State could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row disagrees with its own payload.
    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),
}

/// Checkpoint store backed by a single-connection SQLite pool.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Open (creating if needed) the database at `path` and ensure the table exists.
    ///
    /// `path` may be a file path or [`MEMORY_DATABASE`].
    pub async fn open(path: &str) -> Result<Self, CheckpointError> {
        let options = if path == MEMORY_DATABASE || path == ":memory:" {
            SqliteConnectOptions::from_str(MEMORY_DATABASE)?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };

        // a single long-lived connection; an in-memory database dies with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call [`CheckpointStore::initialize`] before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the checkpoint table if it is missing.
    pub async fn initialize(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                build_key TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Save `state` as the latest checkpoint for its build key.
    pub async fn save(&self, state: &PipelineState) -> Result<(), CheckpointError> {
        let encoded = serde_json::to_string(state)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints (build_key, stage, state, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(state.build_key.to_string())
        .bind(state.stage.as_str())
        .bind(encoded)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Latest checkpoint for `build_key`, if any.
    pub async fn load(&self, build_key: Uuid) -> Result<Option<PipelineState>, CheckpointError> {
        let row = sqlx::query("SELECT stage, state FROM checkpoints WHERE build_key = ?1")
            .bind(build_key.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stage: String = row.try_get("stage")?;
        let encoded: String = row.try_get("state")?;
        let state: PipelineState = serde_json::from_str(&encoded)?;

        if state.build_key != build_key || state.stage.as_str() != stage {
            return Err(CheckpointError::Corrupt(format!(
                "row for {build_key} at stage '{stage}' holds state {} at stage '{}'",
                state.build_key, state.stage
            )));
        }

        Ok(Some(state))
    }

    /// Drop the checkpoint for `build_key`. Returns whether one existed.
    pub async fn clear(&self, build_key: Uuid) -> Result<bool, CheckpointError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE build_key = ?1")
            .bind(build_key.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of stored checkpoints.
    pub async fn count(&self) -> Result<i64, CheckpointError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM checkpoints")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }
}
