use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::{
    db::error::DatabaseError,
    models::{Account, SyncCursor},
    traits::AccountDirectory,
};

const ACCOUNT_COLUMNS: &str = "id, email, last_history_id, needs_reauth, \
                               access_token_expires_at, watch_expires_at";

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl AccountDirectory for UserRepository {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<Account>, DatabaseError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM users WHERE lower(email) = lower($1)",
            ACCOUNT_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn list_linked(&self) -> Result<Vec<Account>, DatabaseError> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM users
             WHERE refresh_token IS NOT NULL AND needs_reauth = false
             ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn workspace_ids(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT workspace_id FROM user_workspaces
             WHERE user_id = $1
             ORDER BY is_owner DESC, workspace_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn refresh_secret(&self, user_id: &str) -> Result<Option<String>, DatabaseError> {
        let secret: Option<Option<String>> =
            sqlx::query_scalar("SELECT refresh_token FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(secret.flatten().filter(|s| !s.is_empty()))
    }

    async fn update_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE users
             SET access_token = $2, access_token_expires_at = $3, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(access_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_reauth_required(&self, user_id: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE users
             SET needs_reauth = true, access_token = NULL, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn advance_cursor(
        &self,
        user_id: &str,
        cursor: SyncCursor,
    ) -> Result<bool, DatabaseError> {
        // The comparison lives in the WHERE clause so two overlapping writers
        // can never move the cursor backwards.
        let result = sqlx::query(
            "UPDATE users
             SET last_history_id = $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND (last_history_id IS NULL OR last_history_id < $2)",
        )
        .bind(user_id)
        .bind(cursor.as_db()?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_watch_expiry(
        &self,
        user_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE users SET watch_expires_at = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
