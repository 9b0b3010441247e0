use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shared::models::{Notification, SyncCursor};

use crate::gmail::MessageRef;

/// Pub/Sub push envelope as delivered to the webhook.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    /// Base64 JSON of a [`MailboxChange`].
    pub data: Option<String>,
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxChange {
    #[serde(rename = "emailAddress")]
    pub email_address: Option<String>,
    /// Gmail sends this as a number; older tooling sends a string.
    #[serde(rename = "historyId")]
    pub history_id: Option<serde_json::Value>,
}

/// One provider change record, in each of the shapes history.list can report.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    MessageAdded(MessageRef),
    LabelsAdded {
        message: MessageRef,
        label_ids: Vec<String>,
    },
    Listed(MessageRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMessageRef {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaSource {
    History,
    FallbackScan,
}

#[derive(Debug, Clone)]
pub struct Delta {
    pub candidates: Vec<CandidateMessageRef>,
    /// `None` on the fallback path.
    pub new_cursor: Option<SyncCursor>,
    pub source: DeltaSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Ingested,
    Duplicate,
    NotCorrelated,
    Vanished,
    /// Failed for a reason expected to clear up; the batch is retried.
    Deferred,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub candidates: usize,
    pub ingested: usize,
    pub duplicates: usize,
    pub not_correlated: usize,
    pub vanished: usize,
    pub deferred: usize,
    pub failed: usize,
    pub cursor_advanced_to: Option<SyncCursor>,
    pub used_fallback: bool,
}

impl RunReport {
    pub fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Ingested => self.ingested += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::NotCorrelated => self.not_correlated += 1,
            MessageOutcome::Vanished => self.vanished += 1,
            MessageOutcome::Deferred => self.deferred += 1,
            MessageOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundAttachment {
    pub filename: String,
    pub media_type: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub workspace_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<OutboundAttachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewEmailPayload {
    pub notification: Notification,
    #[serde(rename = "customerId")]
    pub contact_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateEmailsPayload {
    #[serde(rename = "customerId")]
    pub contact_id: String,
}

/// Event pushed to a user's live connections; serializes as
/// `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum RealtimeEvent {
    #[serde(rename = "newEmail")]
    NewEmail(NewEmailPayload),
    #[serde(rename = "updateEmails")]
    UpdateEmails(UpdateEmailsPayload),
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::NewEmail(_) => "newEmail",
            RealtimeEvent::UpdateEmails(_) => "updateEmails",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WatchRegistration {
    pub user_id: String,
    pub history_id: String,
    #[serde(with = "time::serde::iso8601")]
    pub expires_at: time::OffsetDateTime,
}
