use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the fake provider serves and what it has been asked.
#[derive(Default)]
pub struct MockState {
    pub messages: HashMap<String, Value>,
    /// Newest first, as `messages.list` returns them.
    pub inbox: Vec<String>,
    pub attachments: HashMap<String, String>,
    pub history: Vec<Value>,
    pub history_position: u64,
    pub history_expired: bool,
    /// Status every `history.list` call answers with while set.
    pub history_failure: Option<u16>,
    /// Message ids whose `messages.get` answers 500.
    pub failing_messages: HashSet<String>,
    pub history_requests: Vec<HashMap<String, String>>,
    pub list_requests: Vec<HashMap<String, String>>,
    pub message_fetches: usize,
    pub sent_raw: Vec<String>,
    pub send_rejection: Option<(u16, String)>,
    pub token_revoked: bool,
    pub token_requests: usize,
    pub profile_position: u64,
    pub watch_requests: Vec<Value>,
}

type Shared = Arc<Mutex<MockState>>;

/// In-process stand-in for the OAuth token endpoint and the Gmail REST API.
pub struct MockGmailServer {
    pub base_url: String,
    state: Shared,
    _task: JoinHandle<()>,
}

impl MockGmailServer {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState {
            profile_position: 1,
            ..MockState::default()
        }));

        let app = Router::new()
            .route("/token", post(token))
            .route("/gmail/v1/users/me/history", get(list_history))
            .route("/gmail/v1/users/me/messages", get(list_messages))
            .route("/gmail/v1/users/me/messages/send", post(send_message))
            .route("/gmail/v1/users/me/messages/:id", get(get_message))
            .route(
                "/gmail/v1/users/me/messages/:id/attachments/:attachment_id",
                get(get_attachment),
            )
            .route("/gmail/v1/users/me/watch", post(watch))
            .route("/gmail/v1/users/me/profile", get(profile))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            _task: task,
        }
    }

    pub fn api_base(&self) -> String {
        format!("{}/gmail/v1", self.base_url)
    }

    pub fn token_url(&self) -> String {
        format!("{}/token", self.base_url)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Makes the message fetchable and puts it at the top of the inbox.
    pub fn add_message(&self, message: Value) {
        let id = message["id"].as_str().unwrap().to_string();
        let mut state = self.state();
        state.inbox.insert(0, id.clone());
        state.messages.insert(id, message);
    }

    pub fn add_attachment(&self, attachment_id: &str, content: &[u8]) {
        self.state()
            .attachments
            .insert(attachment_id.to_string(), URL_SAFE_NO_PAD.encode(content));
    }

    /// Replaces the history so the next `history.list` reports these ids as
    /// added, ending at `position`.
    pub fn set_history_added(&self, message_ids: &[&str], position: u64) {
        let history = message_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                json!({
                    "id": (position - message_ids.len() as u64 + i as u64 + 1).to_string(),
                    "messagesAdded": [{"message": {"id": id, "threadId": format!("thread-{}", id)}}]
                })
            })
            .collect();

        let mut state = self.state();
        state.history = history;
        state.history_position = position;
        state.history_expired = false;
    }

    /// `(startHistoryId, pageToken)` of every `history.list` call.
    pub fn history_pages_requested(&self) -> Vec<(String, Option<String>)> {
        self.state()
            .history_requests
            .iter()
            .map(|params| {
                (
                    params.get("startHistoryId").cloned().unwrap_or_default(),
                    params.get("pageToken").cloned(),
                )
            })
            .collect()
    }

    pub fn history_starts(&self) -> Vec<String> {
        self.state()
            .history_requests
            .iter()
            .filter_map(|params| params.get("startHistoryId").cloned())
            .collect()
    }
}

pub fn inbound_message(id: &str, from: &str, subject: &str, body: &str, internal_ms: i64) -> Value {
    json!({
        "id": id,
        "threadId": format!("thread-{}", id),
        "labelIds": ["INBOX", "UNREAD"],
        "internalDate": internal_ms.to_string(),
        "payload": {
            "partId": "",
            "mimeType": "multipart/mixed",
            "filename": "",
            "headers": [
                {"name": "From", "value": from},
                {"name": "To", "value": "alice@biz.com"},
                {"name": "Subject", "value": subject}
            ],
            "parts": [{
                "partId": "0",
                "mimeType": "text/plain",
                "filename": "",
                "body": {"size": body.len(), "data": URL_SAFE_NO_PAD.encode(body)}
            }]
        }
    })
}

pub fn with_attachment(mut message: Value, filename: &str, attachment_id: &str) -> Value {
    if let Some(parts) = message["payload"]["parts"].as_array_mut() {
        parts.push(json!({
            "partId": (parts.len()).to_string(),
            "mimeType": "text/plain",
            "filename": filename,
            "body": {"attachmentId": attachment_id, "size": 5}
        }));
    }
    message
}

fn error(status: StatusCode, reason: &str) -> Response {
    (
        status,
        Json(json!({"error": {"code": status.as_u16(), "message": reason}})),
    )
        .into_response()
}

async fn token(State(state): State<Shared>) -> Response {
    let mut state = state.lock().unwrap();
    state.token_requests += 1;
    if state.token_revoked {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant", "error_description": "Token has been expired or revoked."})),
        )
            .into_response();
    }
    Json(json!({
        "access_token": format!("access-{}", state.token_requests),
        "expires_in": 3599,
        "token_type": "Bearer"
    }))
    .into_response()
}

async fn list_history(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    let page_size = params
        .get("maxResults")
        .and_then(|m| m.parse::<usize>().ok())
        .unwrap_or(100)
        .max(1);
    let offset = params
        .get("pageToken")
        .and_then(|t| t.parse::<usize>().ok())
        .unwrap_or(0);
    state.history_requests.push(params);

    if let Some(status) = state.history_failure {
        let status = StatusCode::from_u16(status).unwrap();
        return error(status, "Backend Error");
    }
    if state.history_expired {
        return error(StatusCode::NOT_FOUND, "Requested entity was not found.");
    }

    let page: Vec<Value> = state
        .history
        .iter()
        .skip(offset)
        .take(page_size)
        .cloned()
        .collect();
    let mut body = json!({
        "history": page,
        "historyId": state.history_position.to_string()
    });
    if offset + page_size < state.history.len() {
        body["nextPageToken"] = json!((offset + page_size).to_string());
    }
    Json(body).into_response()
}

async fn list_messages(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    let max = params
        .get("maxResults")
        .and_then(|m| m.parse::<usize>().ok())
        .unwrap_or(100);
    state.list_requests.push(params);

    let messages: Vec<Value> = state
        .inbox
        .iter()
        .take(max)
        .map(|id| json!({"id": id, "threadId": format!("thread-{}", id)}))
        .collect();
    Json(json!({"messages": messages, "resultSizeEstimate": messages.len()})).into_response()
}

async fn get_message(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    state.message_fetches += 1;
    if state.failing_messages.contains(&id) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "Backend Error");
    }
    match state.messages.get(&id) {
        Some(message) => Json(message.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, "Requested entity was not found."),
    }
}

async fn get_attachment(
    State(state): State<Shared>,
    Path((_id, attachment_id)): Path<(String, String)>,
) -> Response {
    let state = state.lock().unwrap();
    match state.attachments.get(&attachment_id) {
        Some(data) => Json(json!({"size": data.len(), "data": data})).into_response(),
        None => error(StatusCode::NOT_FOUND, "Requested entity was not found."),
    }
}

async fn send_message(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    if let Some((status, reason)) = state.send_rejection.clone() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
        return error(status, &reason);
    }
    state
        .sent_raw
        .push(body["raw"].as_str().unwrap_or_default().to_string());
    let n = state.sent_raw.len();
    Json(json!({
        "id": format!("sent-{}", n),
        "threadId": format!("thread-sent-{}", n),
        "labelIds": ["SENT"]
    }))
    .into_response()
}

async fn watch(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    state.watch_requests.push(body);
    let expiration = (time::OffsetDateTime::now_utc() + time::Duration::days(7)).unix_timestamp() * 1000;
    Json(json!({
        "historyId": state.profile_position.to_string(),
        "expiration": expiration.to_string()
    }))
    .into_response()
}

async fn profile(State(state): State<Shared>) -> Response {
    let state = state.lock().unwrap();
    Json(json!({
        "emailAddress": "alice@biz.com",
        "messagesTotal": state.messages.len(),
        "historyId": state.profile_position.to_string()
    }))
    .into_response()
}
