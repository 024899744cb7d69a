//! External anonymization processor.
//!
//! The pipeline treats anonymization as an opaque transform: document
//! bytes in, transformed bytes out, or a failure carrying diagnostic text.
//! The [`DocumentTransformer`] trait is exactly that contract; the HTTP
//! implementation lives in [`http`].

pub mod http;

pub use http::HttpAnonymizer;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::AnonymizerError;

/// Opaque document transform: bytes in, transformed bytes out.
#[async_trait]
pub trait DocumentTransformer: Send + Sync {
    async fn transform(&self, document: Bytes, file_name: &str) -> Result<Bytes, AnonymizerError>;
}
