use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::header,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use shared::{telemetry, EmailMessage, StorageError};
use std::collections::HashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::engine::MailSyncEngine;
use crate::error::{MailSyncError, Result};
use crate::models::{OutboundAttachment, PushEnvelope, RealtimeEvent, SendRequest, WatchRegistration};
use crate::webhook::WebhookOutcome;

const MAX_SEND_BODY_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct ApiState {
    pub engine: MailSyncEngine,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/gmail/webhook", post(handle_webhook))
        .route(
            "/gmail/send/:user_id",
            post(send_message).layer(DefaultBodyLimit::max(MAX_SEND_BODY_BYTES)),
        )
        .route("/gmail/messages/:id", delete(delete_message))
        .route("/gmail/watch/:user_id", post(register_watch))
        .route("/files/*path", get(download_file))
        .route("/ws/:user_id", get(realtime_socket))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(telemetry::middleware::trace_layer))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "gmail-connector"
    }))
}

async fn handle_webhook(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    debug!("Received push notification ({} bytes)", body.len());

    let envelope: PushEnvelope = serde_json::from_slice(&body).map_err(|e| {
        MailSyncError::MalformedWebhookPayload(format!("body is not a push envelope: {}", e))
    })?;

    let response = match state.engine.webhook.handle(&envelope).await? {
        WebhookOutcome::Accepted { history_id, .. } => json!({
            "status": "accepted",
            "historyId": history_id.to_string()
        }),
        WebhookOutcome::Duplicate { history_id } => json!({
            "status": "duplicate",
            "historyId": history_id.to_string()
        }),
    };
    Ok(Json(response))
}

async fn send_message(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<EmailMessage>> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut attachments = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| MailSyncError::Validation(format!("unreadable form: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let media_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let content = field.bytes().await.map_err(|e| {
                    MailSyncError::Validation(format!("unreadable file {}: {}", filename, e))
                })?;
                attachments.push(OutboundAttachment {
                    filename,
                    media_type,
                    content,
                });
            }
            None => {
                let value = field.text().await.map_err(|e| {
                    MailSyncError::Validation(format!("unreadable field {}: {}", name, e))
                })?;
                fields.insert(name, value);
            }
        }
    }

    let mut take = |key: &str| fields.remove(key).unwrap_or_default();
    let request = SendRequest {
        workspace_id: take("workspace_id"),
        to: take("to"),
        subject: take("subject"),
        body: take("message"),
        attachments,
    };

    let sent = state.engine.outbound.send(&user_id, request).await?;
    Ok(Json(sent))
}

#[derive(Debug, Deserialize)]
struct WorkspaceScope {
    workspace_id: String,
}

async fn delete_message(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(scope): Query<WorkspaceScope>,
) -> Result<Json<EmailMessage>> {
    let deleted = state.engine.deletion.delete(&id, &scope.workspace_id).await?;
    Ok(Json(deleted))
}

/// Serves objects of backends without their own public URLs. The last path
/// segment is the display filename.
async fn download_file(
    State(state): State<ApiState>,
    Path(path): Path<String>,
) -> Result<Response> {
    let public_id = path
        .rsplit_once('/')
        .map(|(id, _)| id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MailSyncError::NotFound(format!("file {}", path)))?;

    let object = state.engine.storage.download(public_id).await.map_err(|e| match e {
        StorageError::NotFound(_) => MailSyncError::NotFound(format!("file {}", path)),
        other => MailSyncError::Storage(other),
    })?;

    let media_type = object
        .media_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, media_type),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", object.filename),
            ),
        ],
        object.content,
    )
        .into_response())
}

async fn register_watch(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<WatchRegistration>> {
    let registration = state.engine.watch.register(&user_id).await?;
    Ok(Json(registration))
}

async fn realtime_socket(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Response {
    let events = state.engine.realtime.subscribe(&user_id);
    ws.on_upgrade(move |socket| forward_events(socket, user_id, events))
}

async fn forward_events(
    mut socket: WebSocket,
    user_id: String,
    mut events: broadcast::Receiver<RealtimeEvent>,
) {
    info!("Realtime connection opened for user {}", user_id);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Could not serialize {} event: {}", event.name(), e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Realtime connection of user {} skipped {} event(s)", user_id, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Realtime connection closed for user {}", user_id);
}
