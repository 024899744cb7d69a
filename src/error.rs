//! Error types for docflow operations.
//!
//! Defines error types for the major subsystems:
//! - Object storage (bucket put/get/move contracts)
//! - Anonymizer HTTP transform
//! - Document ingest
//!
//! Broker and worker-pool errors live beside their implementations in
//! `broker` and `notify::pool`.

use thiserror::Error;

/// Errors that can occur during object-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A put collided with an existing object; bytes are never overwritten.
    #[error("Object '{object}' already exists in bucket '{bucket}'")]
    AlreadyExists { bucket: String, object: String },

    /// The requested object is absent.
    #[error("Object '{object}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, object: String },

    /// The backing store was unreachable after the retry budget.
    #[error("Store connection failed after {attempts} attempts: {detail}")]
    Connect { attempts: u32, detail: String },

    /// Any other transport-level failure.
    #[error("Store transport error: {0}")]
    Transport(String),

    /// A download reference could not be generated.
    #[error("Failed to generate download link: {0}")]
    Sign(String),
}

/// Errors that can occur when invoking the external anonymizer.
#[derive(Debug, Error)]
pub enum AnonymizerError {
    /// The HTTP request itself failed (connect, timeout, body read).
    #[error("Anonymizer request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The anonymizer answered non-200; the body is kept as diagnostic text.
    #[error("Anonymizer rejected document ({status}): {detail}")]
    Transform { status: u16, detail: String },
}

/// Errors that can occur during document submission.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The declared content type is not the accepted document type.
    #[error("Unsupported content type '{0}': only application/pdf is accepted")]
    UnsupportedContentType(String),

    /// Staging the upload failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Publishing the work item failed.
    #[error("Broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),
}
