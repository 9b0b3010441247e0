//! In-memory implementations of the store traits, for tests and local runs
//! without PostgreSQL. They enforce the same uniqueness and monotonicity
//! rules as the SQL repositories.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::db::error::DatabaseError;
use crate::models::{
    Account, Contact, EmailMessage, NewEmailMessage, NewNotification, Notification,
    NotificationStatus, SyncCursor,
};
use crate::traits::{
    AccountDirectory, ContactDirectory, MessageStore, NotificationStore, WebhookReceiptStore,
};
use crate::utils::generate_ulid;

fn take_pending_failure(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone)]
struct AccountRecord {
    account: Account,
    refresh_secret: Option<String>,
    access_token: Option<String>,
    workspace_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAccountDirectory {
    records: Arc<Mutex<HashMap<String, AccountRecord>>>,
}

impl MemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(
        &self,
        user_id: &str,
        email: &str,
        refresh_secret: Option<&str>,
        cursor: Option<SyncCursor>,
        workspace_ids: &[&str],
    ) {
        let record = AccountRecord {
            account: Account {
                id: user_id.to_string(),
                email: email.to_string(),
                last_history_id: cursor.and_then(|c| c.as_db().ok()),
                needs_reauth: false,
                access_token_expires_at: None,
                watch_expires_at: None,
            },
            refresh_secret: refresh_secret.map(str::to_string),
            access_token: None,
            workspace_ids: workspace_ids.iter().map(|w| w.to_string()).collect(),
        };
        self.records.lock().await.insert(user_id.to_string(), record);
    }

    pub async fn access_token(&self, user_id: &str) -> Option<String> {
        self.records
            .lock()
            .await
            .get(user_id)
            .and_then(|r| r.access_token.clone())
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccountDirectory {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<Account>, DatabaseError> {
        Ok(self
            .records
            .lock()
            .await
            .get(user_id)
            .map(|r| r.account.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .find(|r| r.account.email.eq_ignore_ascii_case(email))
            .map(|r| r.account.clone()))
    }

    async fn list_linked(&self) -> Result<Vec<Account>, DatabaseError> {
        let records = self.records.lock().await;
        let mut accounts: Vec<Account> = records
            .values()
            .filter(|r| r.refresh_secret.is_some() && !r.account.needs_reauth)
            .map(|r| r.account.clone())
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn workspace_ids(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        Ok(self
            .records
            .lock()
            .await
            .get(user_id)
            .map(|r| r.workspace_ids.clone())
            .unwrap_or_default())
    }

    async fn refresh_secret(&self, user_id: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .records
            .lock()
            .await
            .get(user_id)
            .and_then(|r| r.refresh_secret.clone())
            .filter(|s| !s.is_empty()))
    }

    async fn update_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), DatabaseError> {
        if let Some(record) = self.records.lock().await.get_mut(user_id) {
            record.access_token = Some(access_token.to_string());
            record.account.access_token_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn mark_reauth_required(&self, user_id: &str) -> Result<(), DatabaseError> {
        if let Some(record) = self.records.lock().await.get_mut(user_id) {
            record.account.needs_reauth = true;
            record.access_token = None;
        }
        Ok(())
    }

    async fn advance_cursor(
        &self,
        user_id: &str,
        cursor: SyncCursor,
    ) -> Result<bool, DatabaseError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(user_id) else {
            return Ok(false);
        };

        match record.account.cursor() {
            Some(current) if current >= cursor => Ok(false),
            _ => {
                record.account.last_history_id = Some(cursor.as_db()?);
                Ok(true)
            }
        }
    }

    async fn update_watch_expiry(
        &self,
        user_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), DatabaseError> {
        if let Some(record) = self.records.lock().await.get_mut(user_id) {
            record.account.watch_expires_at = Some(expires_at);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryContactDirectory {
    contacts: Arc<Mutex<Vec<Contact>>>,
}

impl MemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_contact(&self, id: &str, workspace_id: &str, email: &str, name: Option<&str>) {
        self.contacts.lock().await.push(Contact {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            email: email.to_string(),
            name: name.map(str::to_string),
        });
    }
}

#[async_trait]
impl ContactDirectory for MemoryContactDirectory {
    async fn find_by_email(
        &self,
        email: &str,
        workspace_ids: &[String],
    ) -> Result<Option<Contact>, DatabaseError> {
        let contacts = self.contacts.lock().await;
        Ok(workspace_ids.iter().find_map(|workspace_id| {
            contacts
                .iter()
                .find(|c| &c.workspace_id == workspace_id && c.email.eq_ignore_ascii_case(email))
                .cloned()
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    messages: Arc<Mutex<Vec<EmailMessage>>>,
    pending_failures: Arc<AtomicUsize>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` inserts fail the way an exhausted pool does.
    pub fn fail_next_inserts(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<EmailMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        Ok(self
            .messages
            .lock()
            .await
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned())
    }

    async fn find_by_thread_and_time(
        &self,
        user_id: &str,
        thread_id: &str,
        sent_at: OffsetDateTime,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        Ok(self
            .messages
            .lock()
            .await
            .iter()
            .find(|m| m.user_id == user_id && m.thread_id == thread_id && m.sent_at == sent_at)
            .cloned())
    }

    async fn insert(
        &self,
        message: NewEmailMessage,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        if take_pending_failure(&self.pending_failures) {
            return Err(DatabaseError::Connection(sqlx::Error::PoolTimedOut));
        }

        let mut messages = self.messages.lock().await;
        let taken = messages.iter().any(|m| {
            m.message_id == message.message_id
                || (m.user_id == message.user_id
                    && m.thread_id == message.thread_id
                    && m.sent_at == message.sent_at)
        });
        if taken {
            return Ok(None);
        }

        let stored = EmailMessage {
            id: generate_ulid(),
            user_id: message.user_id,
            workspace_id: message.workspace_id,
            contact_id: message.contact_id,
            counterpart: message.counterpart,
            subject: message.subject,
            body: message.body,
            direction: message.direction,
            thread_id: message.thread_id,
            message_id: message.message_id,
            sent_at: message.sent_at,
            attachments: message.attachments,
            is_deleted: false,
            deleted_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        messages.push(stored.clone());
        Ok(Some(stored))
    }

    async fn find_by_id(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        Ok(self
            .messages
            .lock()
            .await
            .iter()
            .find(|m| m.id == id && m.workspace_id == workspace_id)
            .cloned())
    }

    async fn mark_deleted(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Option<EmailMessage>, DatabaseError> {
        let mut messages = self.messages.lock().await;
        let Some(message) = messages
            .iter_mut()
            .find(|m| m.id == id && m.workspace_id == workspace_id)
        else {
            return Ok(None);
        };

        message.is_deleted = true;
        if message.deleted_at.is_none() {
            message.deleted_at = Some(OffsetDateTime::now_utc());
        }
        Ok(Some(message.clone()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNotificationStore {
    notifications: Arc<Mutex<Vec<Notification>>>,
    pending_failures: Arc<AtomicUsize>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Notification> {
        self.notifications.lock().await.clone()
    }

    /// The next `count` creates fail the way an exhausted pool does.
    pub fn fail_next_creates(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, notification: NewNotification) -> Result<Notification, DatabaseError> {
        if take_pending_failure(&self.pending_failures) {
            return Err(DatabaseError::Connection(sqlx::Error::PoolTimedOut));
        }

        let mut notifications = self.notifications.lock().await;
        if let Some(email_id) = notification.email_id.as_deref() {
            if let Some(existing) = notifications
                .iter()
                .find(|n| n.email_id.as_deref() == Some(email_id))
            {
                return Ok(existing.clone());
            }
        }

        let created = Notification {
            id: generate_ulid(),
            user_id: notification.user_id,
            workspace_id: notification.workspace_id,
            title: notification.title,
            body: notification.body,
            status: NotificationStatus::Unread,
            link: notification.link,
            email_id: notification.email_id,
            created_at: OffsetDateTime::now_utc(),
        };
        notifications.push(created.clone());
        Ok(created)
    }

    async fn find_by_email_id(&self, email_id: &str) -> Result<Option<Notification>, DatabaseError> {
        Ok(self
            .notifications
            .lock()
            .await
            .iter()
            .find(|n| n.email_id.as_deref() == Some(email_id))
            .cloned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryWebhookReceiptStore {
    seen: Arc<Mutex<HashSet<String>>>,
}

impl MemoryWebhookReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookReceiptStore for MemoryWebhookReceiptStore {
    async fn record(&self, history_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.seen.lock().await.insert(history_id.to_string()))
    }
}
