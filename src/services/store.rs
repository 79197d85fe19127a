//! Snapshot store: one encrypted blob per whiteboard.
//!
//! DESIGN
//! ======
//! The server never sees plaintext. A row is overwritten wholesale on every
//! save; `created_at` survives the upsert, `updated_at` is the save time.
//! Postgres backs production; `MemorySnapshotStore` serves tests and runs
//! without `DATABASE_URL`. Connecting to Postgres applies the embedded
//! migrations under `migrations/` before the store is handed out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::api::StoredSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_STORE_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, whiteboard_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError>;

    /// Insert or overwrite the blob. Returns the stored `updated_at`.
    async fn save(&self, whiteboard_id: Uuid, encrypted_data: &str, now_ms: i64) -> Result<i64, StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool and bring the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        sqlx::migrate!().run(&pool).await.map_err(sqlx::Error::from)?;
        info!(max_connections, "store: postgres ready, migrations applied");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn load(&self, whiteboard_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT encrypted_data, updated_at FROM whiteboards WHERE id = $1",
        )
        .bind(whiteboard_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(encrypted_data, updated_at)| StoredSnapshot { encrypted_data, updated_at }))
    }

    async fn save(&self, whiteboard_id: Uuid, encrypted_data: &str, now_ms: i64) -> Result<i64, StoreError> {
        let updated_at = sqlx::query_scalar::<_, i64>(
            r"INSERT INTO whiteboards (id, encrypted_data, created_at, updated_at)
              VALUES ($1, $2, $3, $3)
              ON CONFLICT (id) DO UPDATE
              SET encrypted_data = EXCLUDED.encrypted_data, updated_at = EXCLUDED.updated_at
              RETURNING updated_at",
        )
        .bind(whiteboard_id)
        .bind(encrypted_data)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated_at)
    }
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryRow {
    encrypted_data: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    rows: Arc<RwLock<HashMap<Uuid, MemoryRow>>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When the row was first written.
    pub async fn created_at(&self, whiteboard_id: Uuid) -> Option<i64> {
        self.rows.read().await.get(&whiteboard_id).map(|row| row.created_at)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, whiteboard_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.get(&whiteboard_id).map(|row| StoredSnapshot {
            encrypted_data: row.encrypted_data.clone(),
            updated_at: row.updated_at,
        }))
    }

    async fn save(&self, whiteboard_id: Uuid, encrypted_data: &str, now_ms: i64) -> Result<i64, StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.entry(whiteboard_id).or_insert_with(|| MemoryRow {
            encrypted_data: String::new(),
            created_at: now_ms,
            updated_at: now_ms,
        });
        row.encrypted_data = encrypted_data.to_owned();
        row.updated_at = now_ms;
        Ok(now_ms)
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
