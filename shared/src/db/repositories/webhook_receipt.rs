use async_trait::async_trait;
use sqlx::PgPool;

use crate::{db::error::DatabaseError, traits::WebhookReceiptStore};

#[derive(Clone)]
pub struct WebhookReceiptRepository {
    pool: PgPool,
}

impl WebhookReceiptRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl WebhookReceiptStore for WebhookReceiptRepository {
    async fn record(&self, history_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO webhook_logs (history_id, processed_at)
             VALUES ($1, CURRENT_TIMESTAMP)
             ON CONFLICT (history_id) DO NOTHING",
        )
        .bind(history_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
