//! PostgreSQL state store
//!
//! Records live in a single JSONB table keyed by `(collection, id)`.

use super::{Collection, StateStore};
use crate::error::AppError;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::info;

pub struct PostgresStateStore {
    pool: Pool,
}

impl PostgresStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the records table if it doesn't exist
    pub async fn init(&self) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS envclone_records (
                    collection VARCHAR(64) NOT NULL,
                    id VARCHAR(128) NOT NULL,
                    document JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (collection, id)
                );
                CREATE INDEX IF NOT EXISTS idx_envclone_records_collection
                    ON envclone_records(collection);",
            )
            .await?;
        info!("✅ State store tables initialized");
        Ok(())
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn put(&self, collection: Collection, id: &str, document: serde_json::Value) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO envclone_records (collection, id, document, updated_at)
                 VALUES ($1, $2, $3, NOW())
                 ON CONFLICT (collection, id)
                 DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()",
                &[&collection.as_str(), &id, &document],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<serde_json::Value>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT document FROM envclone_records WHERE collection = $1 AND id = $2",
                &[&collection.as_str(), &id],
            )
            .await?;
        Ok(row.map(|r| r.get("document")))
    }

    async fn list(&self, collection: Collection) -> Result<Vec<serde_json::Value>, AppError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM envclone_records WHERE collection = $1 ORDER BY updated_at",
                &[&collection.as_str()],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("document")).collect())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, AppError> {
        let client = self.pool.get().await?;
        let affected = client
            .execute(
                "DELETE FROM envclone_records WHERE collection = $1 AND id = $2",
                &[&collection.as_str(), &id],
            )
            .await?;
        Ok(affected > 0)
    }
}
