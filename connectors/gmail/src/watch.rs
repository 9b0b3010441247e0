use shared::{Account, AccountDirectory};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{error, info};

use crate::auth::CredentialRefresher;
use crate::error::{MailSyncError, Result};
use crate::gmail::GmailClient;
use crate::models::WatchRegistration;

/// Watches expiring sooner than this are re-registered.
pub const RENEWAL_WINDOW: Duration = Duration::hours(48);

pub fn needs_renewal(account: &Account, now: OffsetDateTime) -> bool {
    match account.watch_expires_at {
        Some(expires_at) => expires_at - now < RENEWAL_WINDOW,
        None => true,
    }
}

#[derive(Clone)]
pub struct WatchRegistrar {
    credentials: CredentialRefresher,
    gmail: GmailClient,
    accounts: Arc<dyn AccountDirectory>,
    topic: Option<String>,
}

impl WatchRegistrar {
    pub fn new(
        credentials: CredentialRefresher,
        gmail: GmailClient,
        accounts: Arc<dyn AccountDirectory>,
        topic: Option<String>,
    ) -> Self {
        Self {
            credentials,
            gmail,
            accounts,
            topic,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.topic.is_some()
    }

    pub async fn register(&self, user_id: &str) -> Result<WatchRegistration> {
        let topic = self.topic.as_deref().ok_or_else(|| {
            MailSyncError::Validation("no push topic configured for mailbox watches".to_string())
        })?;

        self.accounts
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| MailSyncError::UnknownUser(user_id.to_string()))?;

        let access_token = self.credentials.get_valid_access_token(user_id).await?;
        let response = self.gmail.watch(&access_token, user_id, topic).await?;

        let expires_at = response
            .expiration
            .trim()
            .parse::<i128>()
            .ok()
            .and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(ms * 1_000_000).ok())
            .ok_or_else(|| {
                MailSyncError::ProviderRejected(format!(
                    "unreadable watch expiration {:?}",
                    response.expiration
                ))
            })?;

        self.accounts.update_watch_expiry(user_id, expires_at).await?;
        info!(
            "Watch registered for user {} at position {} (expires {})",
            user_id, response.history_id, expires_at
        );

        Ok(WatchRegistration {
            user_id: user_id.to_string(),
            history_id: response.history_id,
            expires_at,
        })
    }

    /// Re-registers every linked mailbox whose watch is missing or close to
    /// expiry. Returns how many were renewed.
    pub async fn renew_expiring(&self) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let due: Vec<Account> = self
            .accounts
            .list_linked()
            .await?
            .into_iter()
            .filter(|account| needs_renewal(account, now))
            .collect();

        let mut renewed = 0;
        for account in due {
            match self.register(&account.id).await {
                Ok(_) => renewed += 1,
                Err(e) => error!("Failed to renew watch for user {}: {}", account.id, e),
            }
        }
        Ok(renewed)
    }
}
