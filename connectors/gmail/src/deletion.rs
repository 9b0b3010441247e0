use shared::{EmailMessage, MessageStore, ObjectStorage, StorageError};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{MailSyncError, Result};

/// Soft delete: the record stays for audit, stored attachment objects are
/// purged.
#[derive(Clone)]
pub struct MessageDeleter {
    messages: Arc<dyn MessageStore>,
    storage: Arc<dyn ObjectStorage>,
}

impl MessageDeleter {
    pub fn new(messages: Arc<dyn MessageStore>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { messages, storage }
    }

    pub async fn delete(&self, id: &str, workspace_id: &str) -> Result<EmailMessage> {
        let message = self
            .messages
            .find_by_id(id, workspace_id)
            .await?
            .ok_or_else(|| MailSyncError::NotFound(format!("message {}", id)))?;

        if message.is_deleted {
            return Ok(message);
        }

        for attachment in &message.attachments {
            match self.storage.destroy(&attachment.storage_id).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => warn!(
                    "Could not purge attachment {} of message {}: {}",
                    attachment.storage_id, id, e
                ),
            }
        }

        let deleted = self
            .messages
            .mark_deleted(id, workspace_id)
            .await?
            .ok_or_else(|| MailSyncError::NotFound(format!("message {}", id)))?;

        info!(
            "Soft-deleted message {} ({} attachment(s) purged)",
            id,
            deleted.attachments.len()
        );
        Ok(deleted)
    }
}
