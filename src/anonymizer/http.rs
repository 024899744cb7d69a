//! HTTP client for the anonymization service.
//!
//! Wire contract: multipart POST with a single `file` field carrying the
//! document as `application/pdf`. A 200 response body is the transformed
//! document; any other status is a failure with the response body kept as
//! diagnostic text.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::debug;

use crate::error::AnonymizerError;
use crate::pipeline::document::DOCUMENT_CONTENT_TYPE;

use super::DocumentTransformer;

/// Client for an anonymizer exposing the multipart transform endpoint.
pub struct HttpAnonymizer {
    client: Client,
    endpoint: String,
}

impl HttpAnonymizer {
    /// Creates a client for the given endpoint URL.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AnonymizerError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl DocumentTransformer for HttpAnonymizer {
    async fn transform(&self, document: Bytes, file_name: &str) -> Result<Bytes, AnonymizerError> {
        let part = Part::bytes(document.to_vec())
            .file_name(file_name.to_string())
            .mime_str(DOCUMENT_CONTENT_TYPE)?;
        let form = Form::new().part("file", part);

        debug!(endpoint = %self.endpoint, file_name, "Sending document to anonymizer");

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AnonymizerError::Transform {
                status: status.as_u16(),
                detail,
            });
        }

        Ok(response.bytes().await?)
    }
}
