//! HTTP surface: upload endpoint, WebSocket endpoint, health check.
//!
//! Routes stay thin; all behavior lives in the pipeline services. The
//! WebSocket upgrade is always accepted and inbound frames are consumed
//! only as a liveness signal.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::IngestError;
use crate::notify::{ClientHandle, NotificationHub};
use crate::pipeline::IngestService;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub hub: Arc<NotificationHub>,
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/upload", post(upload))
        .route("/ws/:session_id", get(websocket))
        .route("/health", get(health))
        .with_state(state)
}

/// Error answered to HTTP callers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(serde_json::json!({ "error": detail }))).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnsupportedContentType(_) => ApiError::BadRequest(err.to_string()),
            IngestError::Store(_) | IngestError::Broker(_) => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    session_id: String,
    document_id: String,
    message: String,
}

/// `POST /v1/upload`: accepts a multipart `file` field and submits it.
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("document.pdf").to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {e}")))?;

        let receipt = state.ingest.submit(data, &file_name, &content_type).await?;

        return Ok(Json(UploadResponse {
            session_id: receipt.session_id,
            document_id: receipt.document_id,
            message: "File uploaded successfully".to_string(),
        }));
    }

    Err(ApiError::BadRequest("Missing 'file' field".to_string()))
}

/// `GET /ws/:session_id`: upgrades and attaches the connection to the hub.
async fn websocket(
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, session_id, state.hub))
}

/// Connection lifecycle: register with the hub, forward outbound payloads,
/// and read inbound frames solely to detect disconnect.
async fn serve_socket(socket: WebSocket, session_id: String, hub: Arc<NotificationHub>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let handle = ClientHandle::new(tx);
    let connection_id = handle.id();
    hub.register(&session_id, handle);
    info!(session_id = %session_id, "WebSocket connected");

    let mut forward = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {
                    // Inbound frames are a liveness signal only.
                    debug!(session_id = %session_id, "Ignoring inbound frame");
                }
            },
            _ = &mut forward => break,
        }
    }

    hub.unregister(&session_id, connection_id);
    forward.abort();
    info!(session_id = %session_id, "WebSocket closed");
}

/// `GET /health`: trivial liveness check.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
