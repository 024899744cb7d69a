//! Ingest stage: accept an upload, stage it, queue a work item.

use std::sync::Arc;

use bytes::Bytes;
use tracing::info;
use uuid::Uuid;

use crate::broker::MessageBroker;
use crate::error::IngestError;
use crate::store::DocumentStore;

use super::document::{
    DocumentMessage, BUCKET_PREPROCESSING, DOCUMENT_CONTENT_TYPE, DOCUMENT_EXCHANGE,
    IN_ROUTING_KEY,
};

/// Identifiers returned to the caller at submission time.
///
/// The session identifier is what the client later connects its WebSocket
/// under; processing continues asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub session_id: String,
    pub document_id: String,
}

/// The upload-facing half of the pipeline.
pub struct IngestService {
    store: Arc<DocumentStore>,
    broker: Arc<dyn MessageBroker>,
}

impl IngestService {
    pub fn new(store: Arc<DocumentStore>, broker: Arc<dyn MessageBroker>) -> Self {
        Self { store, broker }
    }

    /// Submits a document for anonymization.
    ///
    /// Validates the declared content type, mints fresh session and
    /// document identifiers, stages the bytes in the pre-processing
    /// bucket, and publishes a `submitted` work item to the in-queue.
    ///
    /// # Errors
    ///
    /// A wrong content type is a client error; storage or publish failures
    /// abort the submission and surface as server errors. On a publish
    /// failure the staged object is never referenced by any queued item.
    pub async fn submit(
        &self,
        file_bytes: Bytes,
        file_name: &str,
        content_type: &str,
    ) -> Result<SubmitReceipt, IngestError> {
        if content_type != DOCUMENT_CONTENT_TYPE {
            return Err(IngestError::UnsupportedContentType(content_type.to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let document_id = Uuid::new_v4().to_string();
        let object_key = format!("{document_id}.pdf");

        self.store
            .put(BUCKET_PREPROCESSING, &object_key, file_bytes, None)
            .await?;

        let message = DocumentMessage::submitted(
            &session_id,
            &document_id,
            format!("{BUCKET_PREPROCESSING}/{object_key}"),
            file_name,
        );
        self.broker
            .publish(DOCUMENT_EXCHANGE, IN_ROUTING_KEY, &message)
            .await?;

        info!(
            session_id = %session_id,
            document_id = %document_id,
            file_name,
            "Document submitted"
        );

        Ok(SubmitReceipt {
            session_id,
            document_id,
        })
    }
}
