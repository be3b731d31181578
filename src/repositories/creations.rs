use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[async_trait]
pub trait CreationStore: Send + Sync {
    /// Deletes generated images created before `cutoff`, returning how many.
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, anyhow::Error>;
}

#[derive(Clone)]
pub struct CreationRepository {
    conn: PgPool,
}

impl CreationRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CreationStore for CreationRepository {
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let result = sqlx::query("DELETE FROM creations WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.conn)
            .await?;

        Ok(result.rows_affected())
    }
}
