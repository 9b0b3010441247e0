use shared::SyncCursor;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::{MailSyncError, Result};
use crate::gmail::{GmailClient, History, INBOX_LABEL};
use crate::models::{CandidateMessageRef, Delta, DeltaSource, HistoryEvent};

/// Upper bound on history pages followed in one fetch.
pub const MAX_HISTORY_PAGES: usize = 10;

/// Flattens the three shapes a history record can carry into tagged events.
pub fn history_events(history: &[History]) -> Vec<HistoryEvent> {
    let mut events = Vec::new();
    for record in history {
        for added in record.messages_added.iter().flatten() {
            events.push(HistoryEvent::MessageAdded(added.message.clone()));
        }
        for labelled in record.labels_added.iter().flatten() {
            events.push(HistoryEvent::LabelsAdded {
                message: labelled.message.clone(),
                label_ids: labelled.label_ids.clone(),
            });
        }
        for listed in record.messages.iter().flatten() {
            events.push(HistoryEvent::Listed(listed.clone()));
        }
    }
    events
}

/// Canonical candidate list: first occurrence wins, label events only count
/// when they put the message into the inbox.
pub fn normalize(events: impl IntoIterator<Item = HistoryEvent>) -> Vec<CandidateMessageRef> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for event in events {
        let message = match event {
            HistoryEvent::MessageAdded(message) | HistoryEvent::Listed(message) => message,
            HistoryEvent::LabelsAdded { message, label_ids } => {
                if !label_ids.iter().any(|l| l == INBOX_LABEL) {
                    continue;
                }
                message
            }
        };

        if seen.insert(message.id.clone()) {
            candidates.push(CandidateMessageRef { id: message.id });
        }
    }

    candidates
}

#[derive(Clone)]
pub struct DeltaFetcher {
    gmail: GmailClient,
    page_size: u32,
    fallback_scan_size: u32,
}

impl DeltaFetcher {
    pub fn new(gmail: GmailClient, page_size: u32, fallback_scan_size: u32) -> Self {
        Self {
            gmail,
            page_size,
            fallback_scan_size,
        }
    }

    /// Changes since `cursor`. An expired cursor switches to a bounded scan
    /// of the newest inbox messages, which yields no new cursor.
    pub async fn fetch_delta(
        &self,
        access_token: &str,
        user_id: &str,
        cursor: SyncCursor,
    ) -> Result<Delta> {
        match self.fetch_history(access_token, user_id, cursor).await {
            Err(MailSyncError::CursorInvalid(stale)) => {
                warn!(
                    "Cursor {} for user {} is no longer valid; scanning the latest {} inbox messages",
                    stale, user_id, self.fallback_scan_size
                );
                self.fallback_scan(access_token, user_id).await
            }
            other => other,
        }
    }

    async fn fetch_history(
        &self,
        access_token: &str,
        user_id: &str,
        cursor: SyncCursor,
    ) -> Result<Delta> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let mut reported_position: Option<SyncCursor> = None;
        let mut highest_record: Option<SyncCursor> = None;
        let mut truncated = false;

        for page in 0..MAX_HISTORY_PAGES {
            let response = self
                .gmail
                .list_history(
                    access_token,
                    user_id,
                    cursor,
                    self.page_size,
                    page_token.as_deref(),
                )
                .await?;

            let history = response.history.unwrap_or_default();
            highest_record = history
                .iter()
                .filter_map(|h| h.id.parse::<SyncCursor>().ok())
                .chain(highest_record)
                .max();
            events.extend(history_events(&history));

            if let Some(position) = response.history_id.as_deref() {
                reported_position = position.parse().ok().or(reported_position);
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
            if page + 1 == MAX_HISTORY_PAGES {
                truncated = true;
            }
        }

        // Stopping early must not skip the unread pages: resume from the last
        // record actually seen instead of the mailbox head.
        let new_cursor = if truncated {
            info!(
                "History for user {} exceeds {} pages; resuming from the last record seen",
                user_id, MAX_HISTORY_PAGES
            );
            highest_record
        } else {
            reported_position.or(highest_record)
        };

        let candidates = normalize(events);
        debug!(
            "History delta for user {} since {}: {} candidates, new cursor {:?}",
            user_id,
            cursor,
            candidates.len(),
            new_cursor
        );

        Ok(Delta {
            candidates,
            new_cursor,
            source: DeltaSource::History,
        })
    }

    pub async fn fallback_scan(&self, access_token: &str, user_id: &str) -> Result<Delta> {
        let listed = self
            .gmail
            .list_messages(access_token, user_id, INBOX_LABEL, self.fallback_scan_size)
            .await?;

        let candidates = normalize(
            listed
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(HistoryEvent::Listed),
        );

        Ok(Delta {
            candidates,
            new_cursor: None,
            source: DeltaSource::FallbackScan,
        })
    }
}
