use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde_json::Value;
use shared::{AccountDirectory, SyncCursor, WebhookReceiptStore};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{MailSyncError, Result};
use crate::models::{MailboxChange, PushEnvelope};
use crate::sync::IngestionPipeline;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Starts an ingestion run without waiting for it.
pub trait SyncDispatcher: Send + Sync {
    fn dispatch(&self, user_id: String, trigger: SyncCursor);
}

pub struct SpawningDispatcher {
    pipeline: Arc<IngestionPipeline>,
}

impl SpawningDispatcher {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }
}

impl SyncDispatcher for SpawningDispatcher {
    fn dispatch(&self, user_id: String, trigger: SyncCursor) {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            // Failures are already logged by the pipeline; the provider only
            // cares that delivery was acknowledged.
            if let Ok(report) = pipeline.run(&user_id, Some(trigger)).await {
                debug!("Push-triggered run for user {} finished: {:?}", user_id, report);
            }
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Accepted { user_id: String, history_id: SyncCursor },
    Duplicate { history_id: SyncCursor },
}

/// Decodes the push envelope down to the mailbox address and position.
pub fn decode_change(envelope: &PushEnvelope) -> Result<(String, SyncCursor)> {
    let data = envelope
        .message
        .as_ref()
        .and_then(|m| m.data.as_deref())
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| MailSyncError::MalformedWebhookPayload("missing message data".to_string()))?;

    let decoded = STANDARD_LENIENT
        .decode(data.trim())
        .or_else(|_| URL_SAFE_LENIENT.decode(data.trim()))
        .map_err(|e| MailSyncError::MalformedWebhookPayload(format!("data is not base64: {}", e)))?;

    let change: MailboxChange = serde_json::from_slice(&decoded).map_err(|e| {
        MailSyncError::MalformedWebhookPayload(format!("data is not a mailbox change: {}", e))
    })?;

    let history_id = match change.history_id {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(position) => SyncCursor::storable(position).ok_or_else(|| {
                MailSyncError::MalformedWebhookPayload(format!(
                    "historyId {} is out of range",
                    position
                ))
            })?,
            None => {
                return Err(MailSyncError::MalformedWebhookPayload(format!(
                    "historyId {} is not an unsigned integer",
                    n
                )))
            }
        },
        Some(Value::String(s)) => s.parse::<SyncCursor>().map_err(|e| {
            MailSyncError::MalformedWebhookPayload(format!("historyId {:?}: {}", s, e))
        })?,
        _ => {
            return Err(MailSyncError::MalformedWebhookPayload(
                "missing historyId".to_string(),
            ))
        }
    };

    let email = change
        .email_address
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| MailSyncError::MalformedWebhookPayload("missing emailAddress".to_string()))?;

    Ok((email, history_id))
}

#[derive(Clone)]
pub struct WebhookIntake {
    accounts: Arc<dyn AccountDirectory>,
    receipts: Arc<dyn WebhookReceiptStore>,
    dispatcher: Arc<dyn SyncDispatcher>,
}

impl WebhookIntake {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        receipts: Arc<dyn WebhookReceiptStore>,
        dispatcher: Arc<dyn SyncDispatcher>,
    ) -> Self {
        Self {
            accounts,
            receipts,
            dispatcher,
        }
    }

    /// Returns once the run has been handed off; never waits for ingestion.
    pub async fn handle(&self, envelope: &PushEnvelope) -> Result<WebhookOutcome> {
        let (email, history_id) = decode_change(envelope)?;

        let account = self
            .accounts
            .find_by_email(&email)
            .await?
            .ok_or_else(|| {
                info!("Push notification for unknown mailbox {}", email);
                MailSyncError::UnknownUser(email.clone())
            })?;

        let first_delivery = self
            .receipts
            .record(&history_id.to_string())
            .await
            .inspect_err(|e| error!("Could not record webhook receipt {}: {}", history_id, e))?;

        if !first_delivery {
            debug!("Push notification {} already processed", history_id);
            return Ok(WebhookOutcome::Duplicate { history_id });
        }

        info!(
            "Push notification {} for user {}; starting sync",
            history_id, account.id
        );
        self.dispatcher.dispatch(account.id.clone(), history_id);

        Ok(WebhookOutcome::Accepted {
            user_id: account.id,
            history_id,
        })
    }
}
