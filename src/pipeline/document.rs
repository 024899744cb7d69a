//! Work item definitions for the document pipeline.
//!
//! This module defines the core types that travel through the broker:
//!
//! - `DocumentMessage`: a unit of work describing one document
//! - `DocumentStatus`: lifecycle state of a document
//!
//! Completion events are always freshly constructed values; a message that
//! reached the out-queue is never the mutated in-queue item.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the durable direct exchange all pipeline traffic flows through.
pub const DOCUMENT_EXCHANGE: &str = "document-exchange";

/// Queue of submitted work items awaiting transformation.
pub const IN_QUEUE: &str = "in_queue";

/// Queue of completion events awaiting notification delivery.
pub const OUT_QUEUE: &str = "out_queue";

/// Routing key binding the in-queue to the exchange.
pub const IN_ROUTING_KEY: &str = "in-routing-key";

/// Routing key binding the out-queue to the exchange.
pub const OUT_ROUTING_KEY: &str = "out-routing-key";

/// Staging bucket for uploaded documents awaiting anonymization.
pub const BUCKET_PREPROCESSING: &str = "preprocessing";

/// Bucket holding anonymized results.
pub const BUCKET_POSTPROCESSING: &str = "postprocessing";

/// The only content type the pipeline accepts.
pub const DOCUMENT_CONTENT_TYPE: &str = "application/pdf";

/// Metadata key carrying the human-readable reason on failed completions.
pub const METADATA_REASON: &str = "reason";

/// Metadata key carrying the broker redelivery count.
pub const METADATA_ATTEMPTS: &str = "attempts";

/// Lifecycle state of a document moving through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Uploaded and queued, not yet transformed.
    Submitted,
    /// Transformed and stored in the post-processing bucket.
    Anonymized,
    /// The anonymizer rejected the document.
    Failed,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentStatus::Submitted => write!(f, "submitted"),
            DocumentStatus::Anonymized => write!(f, "anonymized"),
            DocumentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work describing one document awaiting or having completed
/// transformation.
///
/// The serialized field names are the wire contract shared by every stage;
/// they must not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMessage {
    /// Client correlation identifier spanning upload through notification.
    pub session_id: String,
    /// Unique identifier of the document, minted at ingest.
    pub document_id: String,
    /// Location of the document as `{bucket}/{object_name}`.
    pub s3_path: String,
    /// File name the client uploaded, echoed back in notifications.
    pub original_file_name: String,
    /// Lifecycle state; absent on messages from pre-status producers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DocumentStatus>,
    /// Free-form string metadata (failure reasons, redelivery accounting).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl DocumentMessage {
    /// Creates the work item published by the ingest stage.
    pub fn submitted(
        session_id: impl Into<String>,
        document_id: impl Into<String>,
        s3_path: impl Into<String>,
        original_file_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            document_id: document_id.into(),
            s3_path: s3_path.into(),
            original_file_name: original_file_name.into(),
            status: Some(DocumentStatus::Submitted),
            metadata: None,
        }
    }

    /// Creates a successful completion event for `source`.
    ///
    /// The returned value is a fresh message pointing at the destination
    /// path; `source` is left untouched.
    pub fn anonymized(source: &DocumentMessage, dest_path: impl Into<String>) -> Self {
        Self {
            session_id: source.session_id.clone(),
            document_id: source.document_id.clone(),
            s3_path: dest_path.into(),
            original_file_name: source.original_file_name.clone(),
            status: Some(DocumentStatus::Anonymized),
            metadata: None,
        }
    }

    /// Creates a failed completion event for `source` carrying a
    /// human-readable reason in the metadata map.
    pub fn failed(source: &DocumentMessage, reason: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_REASON.to_string(), reason.into());
        Self {
            session_id: source.session_id.clone(),
            document_id: source.document_id.clone(),
            s3_path: source.s3_path.clone(),
            original_file_name: source.original_file_name.clone(),
            status: Some(DocumentStatus::Failed),
            metadata: Some(metadata),
        }
    }

    /// Object key of this document within its bucket.
    pub fn object_key(&self) -> String {
        format!("{}.pdf", self.document_id)
    }

    /// Failure reason recorded on `failed` completions, if any.
    pub fn failure_reason(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(METADATA_REASON))
            .map(String::as_str)
    }

    /// Number of delivery attempts recorded on this message.
    ///
    /// Redelivery accounting rides in the metadata map so the wire shape
    /// stays fixed; an absent or unparsable entry counts as zero.
    pub fn delivery_attempts(&self) -> u32 {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(METADATA_ATTEMPTS))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Increments the delivery-attempt counter.
    pub fn record_attempt(&mut self) {
        let attempts = self.delivery_attempts() + 1;
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(METADATA_ATTEMPTS.to_string(), attempts.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted_message() -> DocumentMessage {
        DocumentMessage::submitted("sess-1", "doc-1", "preprocessing/doc-1.pdf", "report.pdf")
    }

    #[test]
    fn test_submitted_message() {
        let msg = submitted_message();

        assert_eq!(msg.session_id, "sess-1");
        assert_eq!(msg.document_id, "doc-1");
        assert_eq!(msg.s3_path, "preprocessing/doc-1.pdf");
        assert_eq!(msg.original_file_name, "report.pdf");
        assert_eq!(msg.status, Some(DocumentStatus::Submitted));
        assert!(msg.metadata.is_none());
    }

    #[test]
    fn test_anonymized_completion_is_fresh_value() {
        let source = submitted_message();
        let completion = DocumentMessage::anonymized(&source, "postprocessing/doc-1.pdf");

        assert_eq!(completion.status, Some(DocumentStatus::Anonymized));
        assert_eq!(completion.s3_path, "postprocessing/doc-1.pdf");
        // The source item is untouched.
        assert_eq!(source.status, Some(DocumentStatus::Submitted));
        assert_eq!(source.s3_path, "preprocessing/doc-1.pdf");
    }

    #[test]
    fn test_failed_completion_carries_reason() {
        let source = submitted_message();
        let completion = DocumentMessage::failed(&source, "anonymizer returned 503");

        assert_eq!(completion.status, Some(DocumentStatus::Failed));
        assert_eq!(completion.failure_reason(), Some("anonymizer returned 503"));
        // The original stays where it was for inspection.
        assert_eq!(completion.s3_path, source.s3_path);
    }

    #[test]
    fn test_object_key() {
        assert_eq!(submitted_message().object_key(), "doc-1.pdf");
    }

    #[test]
    fn test_delivery_attempts_accounting() {
        let mut msg = submitted_message();
        assert_eq!(msg.delivery_attempts(), 0);

        msg.record_attempt();
        msg.record_attempt();
        assert_eq!(msg.delivery_attempts(), 2);
    }

    #[test]
    fn test_wire_field_names_are_stable() {
        let msg = submitted_message();
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();

        assert_eq!(value["session_id"], "sess-1");
        assert_eq!(value["document_id"], "doc-1");
        assert_eq!(value["s3_path"], "preprocessing/doc-1.pdf");
        assert_eq!(value["original_file_name"], "report.pdf");
        assert_eq!(value["status"], "submitted");
    }

    #[test]
    fn test_status_field_is_optional_on_decode() {
        let raw = r#"{
            "session_id": "s",
            "document_id": "d",
            "s3_path": "preprocessing/d.pdf",
            "original_file_name": "f.pdf"
        }"#;
        let msg: DocumentMessage = serde_json::from_str(raw).unwrap();

        assert!(msg.status.is_none());
        assert!(msg.metadata.is_none());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut msg = submitted_message();
        msg.record_attempt();

        let json = serde_json::to_string(&msg).unwrap();
        let parsed: DocumentMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, msg);
        assert_eq!(parsed.delivery_attempts(), 1);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", DocumentStatus::Submitted), "submitted");
        assert_eq!(format!("{}", DocumentStatus::Anonymized), "anonymized");
        assert_eq!(format!("{}", DocumentStatus::Failed), "failed");
    }
}
