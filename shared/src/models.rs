use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};
use sqlx::types::time::OffsetDateTime;
use sqlx::FromRow;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

/// Provider mailbox position. Gmail history ids are unsigned 64-bit counters
/// that only grow for a given mailbox, which is what makes cursor
/// monotonicity checkable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(u64);

impl SyncCursor {
    /// Largest position that fits the BIGINT column the cursor is stored in.
    pub const MAX_STORABLE: u64 = i64::MAX as u64;

    pub fn new(position: u64) -> Self {
        Self(position)
    }

    /// Accepts only positions that can be persisted without wrapping.
    pub fn storable(position: u64) -> Option<Self> {
        (position <= Self::MAX_STORABLE).then_some(Self(position))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Postgres has no unsigned 64-bit type; positions are stored as BIGINT.
    pub fn as_db(&self) -> Result<i64, DatabaseError> {
        i64::try_from(self.0).map_err(|_| {
            DatabaseError::OutOfRange(format!("history position {} exceeds BIGINT", self.0))
        })
    }

    pub fn from_db(value: i64) -> Option<Self> {
        u64::try_from(value).ok().map(Self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorParseError {
    #[error("not an unsigned integer: {0}")]
    Invalid(#[from] ParseIntError),

    #[error("position {0} exceeds the storable range")]
    OutOfRange(u64),
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SyncCursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let position = s.trim().parse::<u64>()?;
        Self::storable(position).ok_or(CursorParseError::OutOfRange(position))
    }
}

/// The slice of a user record this engine is allowed to see. The long-lived
/// refresh secret is deliberately absent; only the credential store reads it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub last_history_id: Option<i64>,
    pub needs_reauth: bool,
    #[serde(with = "time::serde::iso8601::option")]
    pub access_token_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601::option")]
    pub watch_expires_at: Option<OffsetDateTime>,
}

impl Account {
    pub fn cursor(&self) -> Option<SyncCursor> {
        self.last_history_id.and_then(SyncCursor::from_db)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contact {
    pub id: String,
    pub workspace_id: String,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub filename: String,
    pub url: String,
    pub media_type: String,
    pub storage_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailMessage {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub contact_id: Option<String>,
    /// Sender for received mail, recipient for sent mail.
    pub counterpart: String,
    pub subject: String,
    pub body: String,
    pub direction: MessageDirection,
    pub thread_id: String,
    pub message_id: String,
    #[serde(with = "time::serde::iso8601")]
    pub sent_at: OffsetDateTime,
    #[sqlx(json)]
    pub attachments: Vec<StoredAttachment>,
    pub is_deleted: bool,
    #[serde(with = "time::serde::iso8601::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewEmailMessage {
    pub user_id: String,
    pub workspace_id: String,
    pub contact_id: Option<String>,
    pub counterpart: String,
    pub subject: String,
    pub body: String,
    pub direction: MessageDirection,
    pub thread_id: String,
    pub message_id: String,
    pub sent_at: OffsetDateTime,
    pub attachments: Vec<StoredAttachment>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Unread,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub title: String,
    pub body: String,
    pub status: NotificationStatus,
    pub link: Option<String>,
    pub email_id: Option<String>,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub workspace_id: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    /// Stored message the notification announces, at most one per message.
    pub email_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookReceipt {
    pub history_id: String,
    #[serde(with = "time::serde::iso8601")]
    pub processed_at: OffsetDateTime,
}
