use async_trait::async_trait;
use sqlx::PgPool;

use crate::{db::error::DatabaseError, models::Contact, traits::ContactDirectory};

#[derive(Clone)]
pub struct ContactRepository {
    pool: PgPool,
}

impl ContactRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl ContactDirectory for ContactRepository {
    async fn find_by_email(
        &self,
        email: &str,
        workspace_ids: &[String],
    ) -> Result<Option<Contact>, DatabaseError> {
        if workspace_ids.is_empty() {
            return Ok(None);
        }

        let contact = sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, workspace_id, email, name
            FROM customers
            WHERE lower(email) = lower($1)
              AND workspace_id = ANY($2)
            ORDER BY array_position($2, workspace_id)
            LIMIT 1
            "#,
        )
        .bind(email)
        .bind(workspace_ids)
        .fetch_optional(&self.pool)
        .await?;

        Ok(contact)
    }
}
