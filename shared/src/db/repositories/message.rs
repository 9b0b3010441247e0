use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::{
    db::error::DatabaseError,
    models::{EmailMessage, NewEmailMessage},
    traits::MessageStore,
    utils::generate_ulid,
};

const MESSAGE_COLUMNS: &str = "id, user_id, workspace_id, contact_id, counterpart, subject, body, \
                               direction, thread_id, message_id, sent_at, attachments, \
                               is_deleted, deleted_at, created_at";

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl MessageStore for MessageRepository {
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        let message = sqlx::query_as::<_, EmailMessage>(&format!(
            "SELECT {} FROM emails WHERE message_id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    async fn find_by_thread_and_time(
        &self,
        user_id: &str,
        thread_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        let message = sqlx::query_as::<_, EmailMessage>(&format!(
            "SELECT {} FROM emails WHERE user_id = $1 AND thread_id = $2 AND sent_at = $3",
            MESSAGE_COLUMNS
        ))
        .bind(user_id)
        .bind(thread_id)
        .bind(sent_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    async fn insert(
        &self,
        message: NewEmailMessage,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        // Both unique indexes (message_id and user/thread/sent_at) are covered
        // by the untargeted ON CONFLICT; a conflict yields no row.
        let inserted = sqlx::query_as::<_, EmailMessage>(&format!(
            r#"
            INSERT INTO emails (id, user_id, workspace_id, contact_id, counterpart, subject, body,
                                direction, thread_id, message_id, sent_at, attachments)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(generate_ulid())
        .bind(&message.user_id)
        .bind(&message.workspace_id)
        .bind(&message.contact_id)
        .bind(&message.counterpart)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.direction)
        .bind(&message.thread_id)
        .bind(&message.message_id)
        .bind(message.sent_at)
        .bind(sqlx::types::Json(&message.attachments))
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn find_by_id(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        let message = sqlx::query_as::<_, EmailMessage>(&format!(
            "SELECT {} FROM emails WHERE id = $1 AND workspace_id = $2",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    async fn mark_deleted(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        let message = sqlx::query_as::<_, EmailMessage>(&format!(
            r#"
            UPDATE emails
            SET is_deleted = true, deleted_at = COALESCE(deleted_at, CURRENT_TIMESTAMP)
            WHERE id = $1 AND workspace_id = $2
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }
}
