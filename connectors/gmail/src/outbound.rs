use shared::utils::generate_ulid;
use shared::{
    AccountDirectory, ContactDirectory, EmailMessage, MessageDirection, MessageStore,
    NewEmailMessage, StoredAttachment,
};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::attachments::AttachmentOffloader;
use crate::auth::CredentialRefresher;
use crate::error::{MailSyncError, Result};
use crate::gmail::GmailClient;
use crate::identity::extract_address;
use crate::mime;
use crate::models::{RealtimeEvent, SendRequest, UpdateEmailsPayload};
use crate::realtime::RealtimeNotifier;

#[derive(Clone)]
pub struct OutboundSender {
    pub credentials: CredentialRefresher,
    pub gmail: GmailClient,
    pub offloader: AttachmentOffloader,
    pub accounts: Arc<dyn AccountDirectory>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub realtime: RealtimeNotifier,
}

fn validate(request: &SendRequest) -> Result<String> {
    let mut missing = Vec::new();
    if request.to.trim().is_empty() {
        missing.push("to");
    }
    if request.subject.trim().is_empty() {
        missing.push("subject");
    }
    if request.body.trim().is_empty() {
        missing.push("message");
    }
    if request.workspace_id.trim().is_empty() {
        missing.push("workspace_id");
    }
    if !missing.is_empty() {
        return Err(MailSyncError::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    extract_address(&request.to).ok_or_else(|| {
        MailSyncError::Validation(format!("{:?} is not an email address", request.to))
    })
}

impl OutboundSender {
    /// Sends as the user and records the sent message. Attachments are
    /// uploaded before the send; any upload failure aborts it.
    pub async fn send(&self, user_id: &str, request: SendRequest) -> Result<EmailMessage> {
        let recipient = validate(&request)?;

        self.accounts
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| MailSyncError::UnknownUser(user_id.to_string()))?;

        let access_token = self.credentials.get_valid_access_token(user_id).await?;

        let boundary = format!("crm_{}", generate_ulid());
        let (uploaded, raw) = tokio::join!(
            self.offloader.offload_outbound(&request.attachments),
            async {
                mime::compose_raw(
                    &request.to,
                    &request.subject,
                    &request.body,
                    &request.attachments,
                    &boundary,
                )
            }
        );
        let uploaded = uploaded?;

        let sent = match self.gmail.send_message(&access_token, user_id, &raw).await {
            Ok(sent) => sent,
            Err(e) => {
                self.discard(&uploaded).await;
                return Err(match e {
                    MailSyncError::ProviderUnavailable(detail) => MailSyncError::SendFailed(detail),
                    other => other,
                });
            }
        };

        info!(
            "User {} sent message {} to {}",
            user_id, sent.id, recipient
        );

        let contact = self
            .contacts
            .find_by_email(&recipient, std::slice::from_ref(&request.workspace_id))
            .await?;

        let record = NewEmailMessage {
            user_id: user_id.to_string(),
            workspace_id: request.workspace_id.clone(),
            contact_id: contact.as_ref().map(|c| c.id.clone()),
            counterpart: recipient,
            subject: request.subject,
            body: request.body,
            direction: MessageDirection::Sent,
            thread_id: sent.thread_id,
            message_id: sent.id.clone(),
            sent_at: OffsetDateTime::now_utc(),
            attachments: uploaded,
        };

        let stored = match self.messages.insert(record).await? {
            Some(stored) => stored,
            None => self
                .messages
                .find_by_message_id(&sent.id)
                .await?
                .ok_or_else(|| MailSyncError::NotFound(format!("sent message {}", sent.id)))?,
        };

        if let Some(contact) = contact {
            self.realtime.notify(
                user_id,
                RealtimeEvent::UpdateEmails(UpdateEmailsPayload {
                    contact_id: contact.id,
                }),
            );
        }

        Ok(stored)
    }

    async fn discard(&self, uploaded: &[StoredAttachment]) {
        for attachment in uploaded {
            if let Err(e) = self
                .offloader
                .storage()
                .destroy(&attachment.storage_id)
                .await
            {
                warn!(
                    "Could not remove upload {} after failed send: {}",
                    attachment.storage_id, e
                );
            }
        }
    }
}
