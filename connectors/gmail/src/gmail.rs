use dashmap::DashMap;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::telemetry::http_client::RequestBuilderExt;
use shared::{RateLimiter, RetryableError, SyncCursor};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{MailSyncError, Result};

pub const INBOX_LABEL: &str = "INBOX";

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Stateless with respect to credentials: every call takes the access token
/// of the mailbox it acts on. Rate limiting is per mailbox.
#[derive(Clone)]
pub struct GmailClient {
    client: Client,
    api_base: String,
    requests_per_second: u32,
    max_retries: u32,
    retry_base_delay: Duration,
    mailbox_rate_limiters: Arc<DashMap<String, Arc<RateLimiter>>>,
}

impl GmailClient {
    pub fn new(
        api_base: impl Into<String>,
        timeout: Duration,
        requests_per_second: u32,
        max_retries: u32,
    ) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            requests_per_second,
            max_retries,
            retry_base_delay: Duration::from_secs(1),
            mailbox_rate_limiters: Arc::new(DashMap::new()),
        })
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn rate_limiter_for(&self, user_id: &str) -> Arc<RateLimiter> {
        self.mailbox_rate_limiters
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(
                    RateLimiter::new(self.requests_per_second, self.max_retries)
                        .with_base_delay(self.retry_base_delay),
                )
            })
            .clone()
    }

    /// Drops the limiter of a mailbox that will not be synced again.
    pub fn forget_mailbox(&self, user_id: &str) {
        self.mailbox_rate_limiters.remove(user_id);
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.api_base, path)
    }

    /// 404 surfaces as `NotFound(context)`; each caller maps it to what a
    /// missing resource means for that endpoint.
    async fn request<T, B>(&self, user_id: &str, context: &str, build: B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Fn() -> RequestBuilder,
    {
        let rate_limiter = self.rate_limiter_for(user_id);
        rate_limiter
            .execute_with_retry(|| {
                let request = build().with_trace_context();
                async move {
                    let response = request.send().await.map_err(|e| {
                        RetryableError::Transient(MailSyncError::ProviderUnavailable(format!(
                            "{}: {}",
                            context, e
                        )))
                    })?;

                    let status = response.status();
                    if !status.is_success() {
                        let retry_after = parse_retry_after(response.headers());
                        let body = response.text().await.unwrap_or_default();
                        return Err(classify_failure(status, retry_after, &body, context));
                    }

                    debug!("Gmail API {} response status: {}", context, status);
                    let response_text = response.text().await.map_err(|e| {
                        RetryableError::Transient(MailSyncError::ProviderUnavailable(format!(
                            "Failed to read {} response body: {}",
                            context, e
                        )))
                    })?;

                    serde_json::from_str::<T>(&response_text).map_err(|e| {
                        RetryableError::Permanent(MailSyncError::ProviderRejected(format!(
                            "Failed to parse {} response: {}",
                            context, e
                        )))
                    })
                }
            })
            .await
    }

    pub async fn list_history(
        &self,
        access_token: &str,
        user_id: &str,
        start: SyncCursor,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<HistoryListResponse> {
        let url = self.url("history");
        let mut params = vec![
            ("startHistoryId", start.to_string()),
            ("labelId", INBOX_LABEL.to_string()),
            ("maxResults", max_results.to_string()),
        ];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }

        self.request(user_id, "history.list", || {
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&params)
        })
        .await
        .map_err(|e| match e {
            MailSyncError::NotFound(_) => MailSyncError::CursorInvalid(start.to_string()),
            other => other,
        })
    }

    pub async fn list_messages(
        &self,
        access_token: &str,
        user_id: &str,
        label: &str,
        max_results: u32,
    ) -> Result<MessagesListResponse> {
        let url = self.url("messages");
        let params = [
            ("labelIds", label.to_string()),
            ("maxResults", max_results.to_string()),
        ];

        self.request(user_id, "messages.list", || {
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&params)
        })
        .await
    }

    pub async fn get_message(
        &self,
        access_token: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<GmailMessage> {
        let url = self.url(&format!("messages/{}", message_id));

        self.request(user_id, "messages.get", || {
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("format", "full")])
        })
        .await
        .map_err(|e| match e {
            MailSyncError::NotFound(_) => MailSyncError::MessageNotFound(message_id.to_string()),
            other => other,
        })
    }

    /// Returns the still-encoded attachment payload.
    pub async fn get_attachment(
        &self,
        access_token: &str,
        user_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<MessagePartBody> {
        let url = self.url(&format!(
            "messages/{}/attachments/{}",
            message_id, attachment_id
        ));

        self.request(user_id, "messages.attachments.get", || {
            self.client.get(&url).bearer_auth(access_token)
        })
        .await
        .map_err(|e| match e {
            MailSyncError::NotFound(_) => MailSyncError::MessageNotFound(message_id.to_string()),
            other => other,
        })
    }

    pub async fn send_message(
        &self,
        access_token: &str,
        user_id: &str,
        raw: &str,
    ) -> Result<SentMessage> {
        let url = self.url("messages/send");
        let body = SendMessageRequest { raw };

        self.request(user_id, "messages.send", || {
            self.client.post(&url).bearer_auth(access_token).json(&body)
        })
        .await
        .map_err(|e| match e {
            MailSyncError::ProviderRejected(detail) | MailSyncError::NotFound(detail) => {
                MailSyncError::SendFailed(detail)
            }
            other => other,
        })
    }

    pub async fn watch(
        &self,
        access_token: &str,
        user_id: &str,
        topic_name: &str,
    ) -> Result<WatchResponse> {
        let url = self.url("watch");
        let body = WatchRequest {
            topic_name,
            label_ids: vec![INBOX_LABEL],
            label_filter_action: "include",
        };

        self.request(user_id, "users.watch", || {
            self.client.post(&url).bearer_auth(access_token).json(&body)
        })
        .await
    }

    pub async fn get_profile(&self, access_token: &str, user_id: &str) -> Result<GmailProfile> {
        let url = self.url("profile");

        self.request(user_id, "users.getProfile", || {
            self.client.get(&url).bearer_auth(access_token)
        })
        .await
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_failure(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
    context: &str,
) -> RetryableError<MailSyncError> {
    let detail = format!("{} failed: HTTP {} - {}", context, status, body);

    // Gmail reports per-user quota exhaustion as 403 with a rateLimitExceeded reason.
    let quota_exhausted = status == StatusCode::FORBIDDEN
        && (body.contains("rateLimitExceeded") || body.contains("RateLimitExceeded"));

    if status == StatusCode::TOO_MANY_REQUESTS || quota_exhausted {
        return RetryableError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            error: MailSyncError::ProviderUnavailable(detail),
        };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RetryableError::Permanent(MailSyncError::ProviderAuth(detail))
        }
        StatusCode::NOT_FOUND => RetryableError::Permanent(MailSyncError::NotFound(detail)),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            RetryableError::Transient(MailSyncError::ProviderUnavailable(detail))
        }
        _ => RetryableError::Permanent(MailSyncError::ProviderRejected(detail)),
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    raw: &'a str,
}

#[derive(Serialize)]
struct WatchRequest<'a> {
    #[serde(rename = "topicName")]
    topic_name: &'a str,
    #[serde(rename = "labelIds")]
    label_ids: Vec<&'a str>,
    #[serde(rename = "labelFilterAction")]
    label_filter_action: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct MessagesListResponse {
    pub messages: Option<Vec<MessageRef>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRef {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "labelIds")]
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    #[serde(rename = "historyId")]
    pub history_id: Option<String>,
    #[serde(rename = "internalDate")]
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "partId")]
    pub part_id: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<MessagePartBody>,
    pub parts: Option<Vec<MessagePart>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePartBody {
    #[serde(rename = "attachmentId")]
    pub attachment_id: Option<String>,
    pub size: Option<u64>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryListResponse {
    pub history: Option<Vec<History>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "historyId")]
    pub history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct History {
    pub id: String,
    pub messages: Option<Vec<MessageRef>>,
    #[serde(rename = "messagesAdded")]
    pub messages_added: Option<Vec<HistoryMessageAdded>>,
    #[serde(rename = "labelsAdded")]
    pub labels_added: Option<Vec<HistoryLabelAdded>>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryMessageAdded {
    pub message: MessageRef,
}

#[derive(Debug, Deserialize)]
pub struct HistoryLabelAdded {
    pub message: MessageRef,
    #[serde(rename = "labelIds")]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GmailProfile {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "messagesTotal")]
    pub messages_total: Option<u64>,
    #[serde(rename = "historyId")]
    pub history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "labelIds")]
    pub label_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct WatchResponse {
    #[serde(rename = "historyId")]
    pub history_id: String,
    /// Milliseconds since the epoch, as a string.
    pub expiration: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), "", "x"),
            RetryableError::RateLimited { retry_after, .. } if retry_after == Duration::from_secs(7)
        ));
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, None, r#"{"reason":"userRateLimitExceeded"}"#, "x"),
            RetryableError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, None, "", "x"),
            RetryableError::Permanent(MailSyncError::ProviderAuth(_))
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, None, "", "x"),
            RetryableError::Permanent(MailSyncError::NotFound(_))
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, None, "", "x"),
            RetryableError::Transient(MailSyncError::ProviderUnavailable(_))
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, None, "invalid to header", "x"),
            RetryableError::Permanent(MailSyncError::ProviderRejected(_))
        ));
    }

    #[test]
    fn test_history_response_parses_all_event_shapes() {
        let raw = r#"{
            "history": [
                {"id": "101", "messages": [{"id": "m1", "threadId": "t1"}]},
                {"id": "102", "messagesAdded": [{"message": {"id": "m2", "threadId": "t2", "labelIds": ["INBOX"]}}]},
                {"id": "103", "labelsAdded": [{"message": {"id": "m3", "threadId": "t3"}, "labelIds": ["INBOX", "UNREAD"]}]}
            ],
            "historyId": "110"
        }"#;

        let parsed: HistoryListResponse = serde_json::from_str(raw).unwrap();
        let history = parsed.history.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].messages_added.as_ref().unwrap()[0].message.id, "m2");
        assert_eq!(history[2].labels_added.as_ref().unwrap()[0].label_ids[0], "INBOX");
        assert_eq!(parsed.history_id.as_deref(), Some("110"));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }
}
