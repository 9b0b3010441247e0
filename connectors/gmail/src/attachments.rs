use bytes::Bytes;
use futures::stream::{self, StreamExt};
use regex::Regex;
use shared::{ObjectStorage, StorageError, StoredAttachment};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::content::{decode_base64url, AttachmentPart};
use crate::error::{MailSyncError, Result};
use crate::gmail::GmailClient;
use crate::models::OutboundAttachment;

const FALLBACK_FILENAME: &str = "attachment";

/// Keeps `[A-Za-z0-9._-]`, replaces everything else with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    static UNSAFE: OnceLock<Option<Regex>> = OnceLock::new();

    let sanitized = match UNSAFE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9._-]").ok()) {
        Some(re) => re.replace_all(filename.trim(), "_").into_owned(),
        None => filename
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
    };

    // A name made only of dots would still resolve to a relative path.
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Moves attachment payloads into object storage. At most `max_in_flight`
/// payloads are held per call.
#[derive(Clone)]
pub struct AttachmentOffloader {
    storage: Arc<dyn ObjectStorage>,
    gmail: GmailClient,
    folder: String,
    upload_timeout: Duration,
    max_in_flight: usize,
}

impl AttachmentOffloader {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        gmail: GmailClient,
        folder: impl Into<String>,
        upload_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            storage,
            gmail,
            folder: folder.into(),
            upload_timeout,
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    async fn store(
        &self,
        content: Bytes,
        filename: &str,
        media_type: &str,
    ) -> std::result::Result<StoredAttachment, StorageError> {
        let filename = sanitize_filename(filename);
        let upload = self
            .storage
            .upload(content, &self.folder, &filename, Some(media_type));

        let stored = tokio::time::timeout(self.upload_timeout, upload)
            .await
            .map_err(|_| {
                StorageError::Backend(format!(
                    "upload of {} timed out after {:?}",
                    filename, self.upload_timeout
                ))
            })??;

        Ok(StoredAttachment {
            filename,
            url: stored.secure_url,
            media_type: media_type.to_string(),
            storage_id: stored.public_id,
        })
    }

    /// Best-effort: parts that cannot be fetched or uploaded are logged and
    /// left out. Order of the surviving parts follows the message.
    pub async fn offload_inbound(
        &self,
        access_token: &str,
        user_id: &str,
        message_id: &str,
        parts: Vec<AttachmentPart>,
    ) -> Vec<StoredAttachment> {
        if parts.is_empty() {
            return Vec::new();
        }

        let results: Vec<(String, Result<StoredAttachment>)> = stream::iter(parts)
            .map(|part| async move {
                let filename = part.filename.clone();
                let result = self
                    .fetch_and_store(access_token, user_id, message_id, part)
                    .await;
                (filename, result)
            })
            .buffered(self.max_in_flight)
            .collect()
            .await;

        results
            .into_iter()
            .filter_map(|(filename, result)| match result {
                Ok(stored) => Some(stored),
                Err(e) => {
                    warn!(
                        "Dropping attachment {} of message {} for user {}: {}",
                        filename, message_id, user_id, e
                    );
                    None
                }
            })
            .collect()
    }

    async fn fetch_and_store(
        &self,
        access_token: &str,
        user_id: &str,
        message_id: &str,
        part: AttachmentPart,
    ) -> Result<StoredAttachment> {
        let encoded = match (part.inline_data, part.attachment_id) {
            (Some(data), _) => data,
            (None, Some(attachment_id)) => self
                .gmail
                .get_attachment(access_token, user_id, message_id, &attachment_id)
                .await?
                .data
                .ok_or_else(|| MailSyncError::AttachmentUploadFailed {
                    filename: part.filename.clone(),
                    reason: "provider returned no attachment data".to_string(),
                })?,
            (None, None) => {
                return Err(MailSyncError::AttachmentUploadFailed {
                    filename: part.filename,
                    reason: "part carries no payload".to_string(),
                })
            }
        };

        let content = decode_base64url(&encoded).map_err(|e| {
            MailSyncError::AttachmentUploadFailed {
                filename: part.filename.clone(),
                reason: format!("undecodable payload: {}", e),
            }
        })?;

        debug!(
            "Uploading {} ({} bytes) from message {}",
            part.filename,
            content.len(),
            message_id
        );

        Ok(self
            .store(Bytes::from(content), &part.filename, &part.media_type)
            .await?)
    }

    /// All-or-nothing: the first failure aborts and objects already uploaded
    /// for this call are destroyed.
    pub async fn offload_outbound(
        &self,
        attachments: &[OutboundAttachment],
    ) -> Result<Vec<StoredAttachment>> {
        // Each upload owns its inputs so the stream stays `Send` behind a
        // spawned handler.
        let uploads = attachments.iter().cloned().map(|attachment| {
            let offloader = self.clone();
            async move {
                let result = offloader
                    .store(attachment.content, &attachment.filename, &attachment.media_type)
                    .await;
                (attachment.filename, result)
            }
        });
        let results: Vec<(String, std::result::Result<StoredAttachment, StorageError>)> =
            stream::iter(uploads)
                .buffered(self.max_in_flight)
                .collect()
                .await;

        let mut stored = Vec::with_capacity(results.len());
        let mut first_failure = None;
        for (filename, result) in results {
            match result {
                Ok(attachment) => stored.push(attachment),
                Err(e) if first_failure.is_none() => {
                    first_failure = Some(MailSyncError::AttachmentUploadFailed {
                        filename,
                        reason: e.to_string(),
                    })
                }
                Err(e) => warn!("Outbound attachment {} also failed: {}", filename, e),
            }
        }

        let Some(failure) = first_failure else {
            return Ok(stored);
        };

        for orphan in &stored {
            if let Err(e) = self.storage.destroy(&orphan.storage_id).await {
                warn!(
                    "Could not remove orphaned upload {}: {}",
                    orphan.storage_id, e
                );
            }
        }
        Err(failure)
    }
}
