use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use shared::{DatabaseError, StorageError};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::error;

#[derive(Debug, Error)]
pub enum MailSyncError {
    #[error("No refresh credential on file for user {0}")]
    CredentialMissing(String),

    #[error("Provider rejected credentials: {0}")]
    ProviderAuth(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("Sync cursor {0} is no longer valid")]
    CursorInvalid(String),

    #[error("Message {0} not found at provider")]
    MessageNotFound(String),

    #[error("Attachment upload failed for {filename}: {reason}")]
    AttachmentUploadFailed { filename: String, reason: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Malformed webhook payload: {0}")]
    MalformedWebhookPayload(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MailSyncError {
    /// Failures expected to clear up by the next trigger.
    pub fn is_transient(&self) -> bool {
        match self {
            MailSyncError::ProviderUnavailable(_) => true,
            MailSyncError::Database(e) => e.is_transient(),
            MailSyncError::Storage(StorageError::Backend(_)) => true,
            _ => false,
        }
    }

    /// Failures that end the run for one user and need the account relinked
    /// or the secret restored.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            MailSyncError::CredentialMissing(_) | MailSyncError::ProviderAuth(_)
        )
    }
}

impl IntoResponse for MailSyncError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            MailSyncError::MalformedWebhookPayload(_) | MailSyncError::Validation(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            MailSyncError::UnknownUser(_) | MailSyncError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            MailSyncError::SendFailed(_) | MailSyncError::AttachmentUploadFailed { .. } => {
                error!("Outbound failure: {}", self);
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            MailSyncError::CredentialMissing(_) | MailSyncError::ProviderAuth(_) => {
                error!("Credential failure: {}", self);
                (
                    StatusCode::BAD_GATEWAY,
                    "Mailbox credentials need to be re-authorized".to_string(),
                )
            }
            _ => {
                error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
            "timestamp": OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, MailSyncError>;
