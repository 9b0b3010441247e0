use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    db::error::DatabaseError,
    models::{NewNotification, Notification, NotificationStatus},
    traits::NotificationStore,
    utils::generate_ulid,
};

#[derive(Clone)]
pub struct NotificationRepository {
    pool: PgPool,
}

impl NotificationRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl NotificationStore for NotificationRepository {
    async fn create(&self, notification: NewNotification) -> Result<Notification, DatabaseError> {
        // A second announcement of the same message returns the first row.
        let created = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, user_id, workspace_id, title, body, status, link, email_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (email_id) DO UPDATE SET email_id = EXCLUDED.email_id
            RETURNING id, user_id, workspace_id, title, body, status, link, email_id, created_at
            "#,
        )
        .bind(generate_ulid())
        .bind(&notification.user_id)
        .bind(&notification.workspace_id)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(NotificationStatus::Unread)
        .bind(&notification.link)
        .bind(&notification.email_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn find_by_email_id(&self, email_id: &str) -> Result<Option<Notification>, DatabaseError> {
        let notification = sqlx::query_as::<_, Notification>(
            r#"
            SELECT id, user_id, workspace_id, title, body, status, link, email_id, created_at
            FROM notifications
            WHERE email_id = $1
            "#,
        )
        .bind(email_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(notification)
    }
}
