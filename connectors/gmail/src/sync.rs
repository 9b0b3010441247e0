use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use shared::{
    AccountDirectory, EmailMessage, MessageDirection, MessageStore, NewEmailMessage,
    NewNotification, NotificationStore, StoredAttachment, SyncCursor, SyncConfig,
};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::attachments::AttachmentOffloader;
use crate::auth::CredentialRefresher;
use crate::content;
use crate::delta::DeltaFetcher;
use crate::error::{MailSyncError, Result};
use crate::gmail::GmailClient;
use crate::identity::{IdentityResolver, Resolution};
use crate::models::{
    CandidateMessageRef, DeltaSource, MessageOutcome, NewEmailPayload, RealtimeEvent, RunReport,
    UpdateEmailsPayload,
};
use crate::realtime::RealtimeNotifier;

/// Everything the pipeline reads from or writes to.
#[derive(Clone)]
pub struct PipelineParts {
    pub credentials: CredentialRefresher,
    pub gmail: GmailClient,
    pub delta: DeltaFetcher,
    pub resolver: IdentityResolver,
    pub offloader: AttachmentOffloader,
    pub accounts: Arc<dyn AccountDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub realtime: RealtimeNotifier,
}

/// Runs one user's mailbox delta end to end. Runs for the same user are
/// serialized; runs across users share a fixed number of slots.
pub struct IngestionPipeline {
    parts: PipelineParts,
    frontend_url: String,
    max_messages_in_flight: usize,
    max_concurrent_users: usize,
    run_slots: Arc<Semaphore>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Cursors the provider rejected. Skipped until a history call succeeds.
    invalidated_cursors: DashMap<String, SyncCursor>,
}

impl IngestionPipeline {
    pub fn new(parts: PipelineParts, sync: &SyncConfig, frontend_url: impl Into<String>) -> Self {
        let max_concurrent_users = sync.max_concurrent_users.max(1);
        Self {
            parts,
            frontend_url: frontend_url.into(),
            max_messages_in_flight: sync.max_messages_in_flight.max(1),
            max_concurrent_users,
            run_slots: Arc::new(Semaphore::new(max_concurrent_users)),
            user_locks: DashMap::new(),
            invalidated_cursors: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `trigger` is the position reported by the push notification, used
    /// only when no usable stored cursor exists.
    pub async fn run(&self, user_id: &str, trigger: Option<SyncCursor>) -> Result<RunReport> {
        let lock = self.user_lock(user_id);
        let _user_guard = lock.lock().await;

        let _slot = self.run_slots.acquire().await.map_err(|_| {
            MailSyncError::ProviderUnavailable("sync scheduler is shutting down".to_string())
        })?;

        let result = self.run_locked(user_id, trigger).await;
        if let Err(e) = &result {
            if e.is_credential_failure() {
                warn!("Skipping mailbox of user {}: {}", user_id, e);
                self.parts.gmail.forget_mailbox(user_id);
            } else {
                error!("Sync run for user {} failed: {}", user_id, e);
            }
        }
        result
    }

    async fn run_locked(&self, user_id: &str, trigger: Option<SyncCursor>) -> Result<RunReport> {
        let account = self
            .parts
            .accounts
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| MailSyncError::UnknownUser(user_id.to_string()))?;

        let access_token = self.parts.credentials.get_valid_access_token(user_id).await?;

        let stored = account.cursor().filter(|cursor| {
            self.invalidated_cursors
                .get(user_id)
                .map_or(true, |rejected| *rejected != *cursor)
        });

        let start = match stored.or(trigger) {
            Some(cursor) => cursor,
            None => {
                let profile = self
                    .parts
                    .gmail
                    .get_profile(&access_token, user_id)
                    .await?;
                let head = profile.history_id.parse::<SyncCursor>().map_err(|e| {
                    MailSyncError::ProviderRejected(format!(
                        "unreadable profile position {:?}: {}",
                        profile.history_id, e
                    ))
                })?;
                info!("No usable cursor for user {}; starting from {}", user_id, head);
                head
            }
        };

        let delta = self
            .parts
            .delta
            .fetch_delta(&access_token, user_id, start)
            .await?;

        let mut report = RunReport {
            candidates: delta.candidates.len(),
            used_fallback: delta.source == DeltaSource::FallbackScan,
            ..RunReport::default()
        };
        if report.used_fallback {
            self.invalidated_cursors.insert(user_id.to_string(), start);
        }

        let workspace_ids = self.parts.accounts.workspace_ids(user_id).await?;

        let outcomes: Vec<MessageOutcome> = stream::iter(delta.candidates)
            .map(|candidate| {
                let access_token = access_token.as_str();
                let workspace_ids = workspace_ids.as_slice();
                async move {
                    self.process_message(access_token, user_id, workspace_ids, candidate)
                        .await
                }
            })
            .buffer_unordered(self.max_messages_in_flight)
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }

        // Advances once per batch, after every message has settled. A deferred
        // message keeps the batch open so the next trigger lists it again.
        if report.deferred > 0 {
            warn!(
                "Holding cursor of user {} at {}: {} message(s) deferred",
                user_id, start, report.deferred
            );
        } else if let Some(new_cursor) = delta.new_cursor {
            self.invalidated_cursors.remove(user_id);
            if self
                .parts
                .accounts
                .advance_cursor(user_id, new_cursor)
                .await?
            {
                report.cursor_advanced_to = Some(new_cursor);
            } else {
                debug!(
                    "Cursor of user {} already at or past {}",
                    user_id, new_cursor
                );
            }
        }

        info!(
            "Sync run for user {} done: {} candidates, {} ingested, {} duplicates, {} not correlated, {} vanished, {} deferred, {} failed{}",
            user_id,
            report.candidates,
            report.ingested,
            report.duplicates,
            report.not_correlated,
            report.vanished,
            report.deferred,
            report.failed,
            if report.used_fallback { " (fallback scan)" } else { "" }
        );

        Ok(report)
    }

    async fn process_message(
        &self,
        access_token: &str,
        user_id: &str,
        workspace_ids: &[String],
        candidate: CandidateMessageRef,
    ) -> MessageOutcome {
        match self
            .ingest_message(access_token, user_id, workspace_ids, &candidate.id)
            .await
        {
            Ok(outcome) => outcome,
            Err(MailSyncError::MessageNotFound(_)) => {
                debug!(
                    "Message {} of user {} disappeared before it could be fetched",
                    candidate.id, user_id
                );
                MessageOutcome::Vanished
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "Deferring message {} for user {}: {}",
                    candidate.id, user_id, e
                );
                MessageOutcome::Deferred
            }
            Err(e) => {
                error!(
                    "Failed to ingest message {} for user {}: {}",
                    candidate.id, user_id, e
                );
                MessageOutcome::Failed
            }
        }
    }

    async fn ingest_message(
        &self,
        access_token: &str,
        user_id: &str,
        workspace_ids: &[String],
        message_id: &str,
    ) -> Result<MessageOutcome> {
        let message = self
            .parts
            .gmail
            .get_message(access_token, user_id, message_id)
            .await?;

        let (contact, sender) = match self
            .parts
            .resolver
            .resolve(user_id, workspace_ids, &message)
            .await?
        {
            Resolution::Duplicate { stored: Some(stored) } => {
                return self.finish_announcement(user_id, stored).await;
            }
            Resolution::Duplicate { stored: None } => return Ok(MessageOutcome::Duplicate),
            Resolution::NotCorrelated { sender } => {
                debug!(
                    "Message {} from {:?} matches no contact; not ingesting",
                    message_id, sender
                );
                return Ok(MessageOutcome::NotCorrelated);
            }
            Resolution::Correlated { contact, sender } => (contact, sender),
        };

        let attachments = self
            .parts
            .offloader
            .offload_inbound(
                access_token,
                user_id,
                message_id,
                content::attachment_parts(&message),
            )
            .await;

        let new_message = NewEmailMessage {
            user_id: user_id.to_string(),
            workspace_id: contact.workspace_id.clone(),
            contact_id: Some(contact.id.clone()),
            counterpart: sender,
            subject: content::subject(&message),
            body: content::body_text(&message),
            direction: MessageDirection::Received,
            thread_id: message.thread_id.clone(),
            message_id: message.id.clone(),
            sent_at: content::sent_at(&message),
            attachments,
        };
        let uploaded = new_message.attachments.clone();

        let stored = match self.parts.messages.insert(new_message).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                // A concurrent run stored it first.
                self.discard_uploads(&uploaded).await;
                return Ok(MessageOutcome::Duplicate);
            }
            Err(e) => {
                self.discard_uploads(&uploaded).await;
                return Err(e.into());
            }
        };

        self.announce(user_id, &stored, &contact.id).await?;
        info!(
            "Ingested message {} for user {} as {}",
            message_id, user_id, stored.id
        );
        Ok(MessageOutcome::Ingested)
    }

    /// A stored inbound message whose notification never landed is announced
    /// now; everything else is a plain duplicate.
    async fn finish_announcement(
        &self,
        user_id: &str,
        stored: EmailMessage,
    ) -> Result<MessageOutcome> {
        let contact_id = match stored.contact_id.as_deref() {
            Some(contact_id)
                if stored.direction == MessageDirection::Received && !stored.is_deleted =>
            {
                contact_id
            }
            _ => return Ok(MessageOutcome::Duplicate),
        };

        if self
            .parts
            .notifications
            .find_by_email_id(&stored.id)
            .await?
            .is_some()
        {
            return Ok(MessageOutcome::Duplicate);
        }

        self.announce(user_id, &stored, contact_id).await?;
        info!(
            "Announced previously stored message {} for user {}",
            stored.message_id, user_id
        );
        Ok(MessageOutcome::Ingested)
    }

    async fn announce(&self, user_id: &str, stored: &EmailMessage, contact_id: &str) -> Result<()> {
        let notification = self
            .parts
            .notifications
            .create(NewNotification {
                user_id: user_id.to_string(),
                workspace_id: stored.workspace_id.clone(),
                title: format!("New Email: {}", stored.subject),
                body: format!("New email received from {}", stored.counterpart),
                link: Some(format!("{}/customerinfo/{}", self.frontend_url, contact_id)),
                email_id: Some(stored.id.clone()),
            })
            .await?;

        self.parts.realtime.notify(
            user_id,
            RealtimeEvent::NewEmail(NewEmailPayload {
                notification,
                contact_id: contact_id.to_string(),
            }),
        );
        self.parts.realtime.notify(
            user_id,
            RealtimeEvent::UpdateEmails(UpdateEmailsPayload {
                contact_id: contact_id.to_string(),
            }),
        );
        Ok(())
    }

    async fn discard_uploads(&self, uploaded: &[StoredAttachment]) {
        for orphan in uploaded {
            if let Err(e) = self.parts.offloader.storage().destroy(&orphan.storage_id).await {
                warn!("Could not remove orphaned upload {}: {}", orphan.storage_id, e);
            }
        }
    }

    /// Scheduled poll over every linked mailbox. Returns the number of runs
    /// that completed.
    pub async fn run_all_linked(&self) -> Result<usize> {
        let accounts = self.parts.accounts.list_linked().await?;
        if accounts.is_empty() {
            debug!("No linked mailboxes to poll");
            return Ok(0);
        }

        info!("Polling {} linked mailbox(es)", accounts.len());
        let completed = stream::iter(accounts)
            .map(|account| async move { self.run(&account.id, None).await.is_ok() })
            .buffer_unordered(self.max_concurrent_users)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        Ok(completed)
    }
}
