use reqwest::Client;
use serde::Deserialize;
use shared::config::GoogleOAuthConfig;
use shared::telemetry::http_client::RequestBuilderExt;
use shared::AccountDirectory;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::{MailSyncError, Result};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Exchanges a user's stored refresh secret for a fresh access token. The
/// refresh secret never leaves this type.
#[derive(Clone)]
pub struct CredentialRefresher {
    client: Client,
    oauth: GoogleOAuthConfig,
    accounts: Arc<dyn AccountDirectory>,
}

impl CredentialRefresher {
    pub fn new(
        oauth: GoogleOAuthConfig,
        accounts: Arc<dyn AccountDirectory>,
        timeout: Duration,
    ) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            oauth,
            accounts,
        })
    }

    /// Always refreshes; there is no local expiry check. Concurrent refreshes
    /// for one user are tolerated and the last write wins.
    pub async fn get_valid_access_token(&self, user_id: &str) -> Result<String> {
        let refresh_secret = self
            .accounts
            .refresh_secret(user_id)
            .await?
            .ok_or_else(|| MailSyncError::CredentialMissing(user_id.to_string()))?;

        debug!("Refreshing access token for user {}", user_id);

        let params = [
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("refresh_token", refresh_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.oauth.token_url)
            .form(&params)
            .with_trace_context()
            .send()
            .await
            .map_err(|e| {
                MailSyncError::ProviderUnavailable(format!("Token endpoint unreachable: {}", e))
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(MailSyncError::ProviderUnavailable(format!(
                "Token endpoint returned HTTP {}",
                status
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<TokenErrorResponse>(&body).ok();
            let reason = parsed
                .as_ref()
                .map(|e| e.error.clone())
                .unwrap_or_else(|| format!("HTTP {}", status));

            if reason == "invalid_grant" {
                warn!(
                    "Refresh credential for user {} was revoked; marking account for re-authorization",
                    user_id
                );
                self.accounts.mark_reauth_required(user_id).await?;
            }

            let description = parsed
                .and_then(|e| e.error_description)
                .unwrap_or_default();
            return Err(MailSyncError::ProviderAuth(format!(
                "{} {}",
                reason, description
            )
            .trim()
            .to_string()));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            MailSyncError::ProviderUnavailable(format!("Unreadable token response: {}", e))
        })?;

        let expires_at = OffsetDateTime::now_utc() + time::Duration::seconds(token.expires_in);
        self.accounts
            .update_access_token(user_id, &token.access_token, expires_at)
            .await?;

        info!(
            "Access token refreshed for user {} (expires at {})",
            user_id, expires_at
        );

        Ok(token.access_token)
    }
}
