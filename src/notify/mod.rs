//! Completion-event delivery: worker pool, notification hub, and the
//! notifier that connects them.
//!
//! The out-queue consumer feeds completion events into the pool via
//! [`CompletionDispatcher`]; each pool worker runs [`Notifier::deliver`],
//! which generates a time-limited download reference and pushes the
//! notification payload through the hub.

pub mod hub;
pub mod pool;

pub use hub::{ClientHandle, NotificationHub, SendOutcome};
pub use pool::{DeliveryHandler, DeliveryPool, PoolError};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::broker::{HandlerError, MessageHandler};
use crate::error::StoreError;
use crate::pipeline::document::{DocumentMessage, DocumentStatus};
use crate::store::DocumentStore;

/// Status values the client sees in notification payloads.
const STATUS_OK: &str = "ok";
const STATUS_ERROR: &str = "error";

/// Errors that can occur while delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Generating the download reference failed.
    #[error("Failed to generate download link: {0}")]
    Link(#[from] StoreError),

    /// The completion event's storage path was not `{bucket}/{object}`.
    #[error("Malformed storage path '{0}'")]
    BadPath(String),

    /// The payload could not be serialized.
    #[error("Failed to encode notification payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The session's connection was dead; the payload was discarded.
    #[error("Notification dropped for session '{0}'")]
    Delivery(String),
}

/// Outbound WebSocket frame, serialized as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub session_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_link: Option<String>,
    pub original_filename: String,
}

/// The pool's downstream action: presign and deliver.
pub struct Notifier {
    store: Arc<DocumentStore>,
    hub: Arc<NotificationHub>,
    link_ttl: Duration,
}

impl Notifier {
    pub fn new(store: Arc<DocumentStore>, hub: Arc<NotificationHub>, link_ttl: Duration) -> Self {
        Self {
            store,
            hub,
            link_ttl,
        }
    }

    /// Builds the client-facing payload for a completion event.
    async fn build_payload(
        &self,
        message: &DocumentMessage,
    ) -> Result<NotificationPayload, NotifyError> {
        if message.status == Some(DocumentStatus::Anonymized) {
            let (bucket, object) = message
                .s3_path
                .split_once('/')
                .ok_or_else(|| NotifyError::BadPath(message.s3_path.clone()))?;
            let download_link = self.store.download_link(bucket, object, self.link_ttl).await?;

            Ok(NotificationPayload {
                session_id: message.session_id.clone(),
                status: STATUS_OK.to_string(),
                download_link: Some(download_link),
                original_filename: message.original_file_name.clone(),
            })
        } else {
            Ok(NotificationPayload {
                session_id: message.session_id.clone(),
                status: STATUS_ERROR.to_string(),
                download_link: None,
                original_filename: message.original_file_name.clone(),
            })
        }
    }
}

#[async_trait]
impl DeliveryHandler for Notifier {
    async fn deliver(&self, message: DocumentMessage) -> Result<(), NotifyError> {
        let payload = self.build_payload(&message).await?;
        let body = serde_json::to_string(&payload)?;

        debug!(
            session_id = %message.session_id,
            status = %payload.status,
            "Delivering notification"
        );

        match self.hub.send(&message.session_id, body) {
            SendOutcome::Delivered | SendOutcome::Buffered => Ok(()),
            SendOutcome::Dropped => Err(NotifyError::Delivery(message.session_id.clone())),
        }
    }
}

/// Out-queue consumer that feeds completion events into the pool.
pub struct CompletionDispatcher {
    pool: Arc<DeliveryPool>,
}

impl CompletionDispatcher {
    pub fn new(pool: Arc<DeliveryPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageHandler for CompletionDispatcher {
    async fn handle(&self, message: DocumentMessage) -> Result<(), HandlerError> {
        debug!(session_id = %message.session_id, "Completion event received");
        self.pool
            .submit(message)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))
    }
}
