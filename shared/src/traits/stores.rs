use crate::db::error::DatabaseError;
use crate::models::{
    Account, Contact, EmailMessage, NewEmailMessage, NewNotification, Notification, SyncCursor,
};
use async_trait::async_trait;
use time::OffsetDateTime;

/// User/account records as seen by the sync engine.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<Account>, DatabaseError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError>;

    /// Accounts holding a refresh secret that have not been flagged for re-authorization.
    async fn list_linked(&self) -> Result<Vec<Account>, DatabaseError>;

    async fn workspace_ids(&self, user_id: &str) -> Result<Vec<String>, DatabaseError>;

    async fn refresh_secret(&self, user_id: &str) -> Result<Option<String>, DatabaseError>;

    async fn update_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), DatabaseError>;

    async fn mark_reauth_required(&self, user_id: &str) -> Result<(), DatabaseError>;

    /// Moves the stored cursor forward. Returns `false` without writing when the
    /// stored cursor is already at or past `cursor`.
    async fn advance_cursor(&self, user_id: &str, cursor: SyncCursor)
        -> Result<bool, DatabaseError>;

    async fn update_watch_expiry(
        &self,
        user_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Case-insensitive lookup restricted to the given workspaces, in the
    /// order the workspaces are listed.
    async fn find_by_email(
        &self,
        email: &str,
        workspace_ids: &[String],
    ) -> Result<Option<Contact>, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError>;

    async fn find_by_thread_and_time(
        &self,
        user_id: &str,
        thread_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<Option<EmailMessage>, DatabaseError>;

    /// Returns `None` when either identity key (message id, or thread id plus
    /// timestamp) is already taken.
    async fn insert(&self, message: NewEmailMessage)
        -> Result<Option<EmailMessage>, DatabaseError>;

    async fn find_by_id(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError>;

    async fn mark_deleted(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Idempotent per `email_id`: announcing a message twice yields the
    /// notification created the first time.
    async fn create(&self, notification: NewNotification) -> Result<Notification, DatabaseError>;

    async fn find_by_email_id(&self, email_id: &str) -> Result<Option<Notification>, DatabaseError>;
}

#[async_trait]
pub trait WebhookReceiptStore: Send + Sync {
    /// Records a push notification receipt. Returns `true` only for the call
    /// that created it.
    async fn record(&self, history_id: &str) -> Result<bool, DatabaseError>;
}
