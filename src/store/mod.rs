//! Bucket-addressed object storage for the document pipeline.
//!
//! This module wraps a generic [`ObjectStore`] backend with the contract
//! the pipeline relies on: conditional-create puts (an object is never
//! overwritten), existence checks that distinguish absence from transport
//! failure, idempotent removal, a three-phase move, and time-limited
//! download references.
//!
//! Buckets are prefix namespaces within the configured backend, so the
//! same code runs against S3, a local directory, or the in-memory store
//! used by tests.

pub mod backend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{Attribute, Attributes, ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::{debug, info, warn};

use crate::config::ConnectRetry;
use crate::error::StoreError;

/// Bucket-addressed document storage.
///
/// Safe for concurrent use by multiple callers; all state lives in the
/// backend.
pub struct DocumentStore {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    public_endpoint: Option<String>,
}

impl DocumentStore {
    /// Creates a store over the given backend.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            signer: None,
            public_endpoint: None,
        }
    }

    /// Attaches a signing backend for presigned download references.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Sets the base URL used for download links when no signer is
    /// available (e.g. a public MinIO endpoint).
    pub fn with_public_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.public_endpoint = Some(endpoint.into());
        self
    }

    /// Probes the backend until it answers, within the retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] when the budget is exhausted; the
    /// caller is expected to abort startup rather than continue without
    /// usable storage.
    pub async fn init(&self, retry: &ConnectRetry) -> Result<(), StoreError> {
        let probe = Path::from("docflow-probe");
        let mut last_err = None;

        for attempt in 1..=retry.attempts {
            match self.store.head(&probe).await {
                // The probe object is not expected to exist; any answer
                // from the backend means it is reachable.
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                    info!(attempt, "Object store reachable");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Object store probe failed");
                    last_err = Some(e);
                    if attempt < retry.attempts {
                        tokio::time::sleep(retry.delay).await;
                    }
                }
            }
        }

        Err(StoreError::Connect {
            attempts: retry.attempts,
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn object_path(bucket: &str, object_name: &str) -> Path {
        Path::from(format!("{bucket}/{object_name}"))
    }

    /// Ensures a bucket namespace is usable. Idempotent.
    ///
    /// Buckets are prefix namespaces within the backend, so there is
    /// nothing to physically create; this verifies the backend answers
    /// for the prefix.
    pub async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let probe = Self::object_path(bucket, "docflow-probe");
        match self.store.head(&probe).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                debug!(bucket, "Bucket ready");
                Ok(())
            }
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }

    /// Stores `bytes` under `(bucket, object_name)`.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the object is present;
    /// an object is never overwritten.
    pub async fn put(
        &self,
        bucket: &str,
        object_name: &str,
        bytes: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), StoreError> {
        let path = Self::object_path(bucket, object_name);

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            crate::pipeline::document::DOCUMENT_CONTENT_TYPE.into(),
        );
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                attributes.insert(Attribute::Metadata(key.into()), value.into());
            }
        }

        let mut options = PutOptions::from(PutMode::Create);
        options.attributes = attributes;

        match self
            .store
            .put_opts(&path, PutPayload::from(bytes), options)
            .await
        {
            Ok(_) => {
                debug!(bucket, object = object_name, "Object stored");
                Ok(())
            }
            Err(object_store::Error::AlreadyExists { .. }) => Err(StoreError::AlreadyExists {
                bucket: bucket.to_string(),
                object: object_name.to_string(),
            }),
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }

    /// Retrieves the bytes stored under `(bucket, object_name)`.
    pub async fn get(&self, bucket: &str, object_name: &str) -> Result<Bytes, StoreError> {
        let path = Self::object_path(bucket, object_name);

        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound {
                    bucket: bucket.to_string(),
                    object: object_name.to_string(),
                })
            }
            Err(e) => return Err(StoreError::Transport(e.to_string())),
        };

        result
            .bytes()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))
    }

    /// Returns whether `(bucket, object_name)` exists.
    ///
    /// Absence is a `false` answer; any other failure is a transport error.
    pub async fn exists(&self, bucket: &str, object_name: &str) -> Result<bool, StoreError> {
        let path = Self::object_path(bucket, object_name);

        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }

    /// Removes `(bucket, object_name)`. Removing a missing object is not
    /// an error.
    pub async fn remove(&self, bucket: &str, object_name: &str) -> Result<(), StoreError> {
        let path = Self::object_path(bucket, object_name);

        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                debug!(bucket, object = object_name, "Object removed");
                Ok(())
            }
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }

    /// Moves an object between buckets as get → put → remove.
    ///
    /// The three phases are not atomic. When the destination already
    /// exists the copy phase is skipped and the move proceeds straight to
    /// the remove, so a retry after a partial failure converges instead of
    /// failing on the conditional put.
    ///
    /// Returns the new `{bucket}/{path}` of the object.
    pub async fn move_object(
        &self,
        object_name: &str,
        src_bucket: &str,
        dest_bucket: &str,
        dest_subpath: &str,
    ) -> Result<String, StoreError> {
        let dest_key = if dest_subpath.is_empty() {
            object_name.to_string()
        } else {
            format!("{dest_subpath}/{object_name}")
        };

        if self.exists(dest_bucket, &dest_key).await? {
            debug!(
                src = src_bucket,
                dest = dest_bucket,
                object = object_name,
                "Destination already present, skipping copy"
            );
        } else {
            let data = self.get(src_bucket, object_name).await?;
            match self.put(dest_bucket, &dest_key, data, None).await {
                Ok(()) => {}
                // Lost a race with a concurrent mover; the bytes are there.
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.remove(src_bucket, object_name).await?;

        Ok(format!("{dest_bucket}/{dest_key}"))
    }

    /// Generates a time-limited download reference for an object.
    ///
    /// Uses the signing backend when one is attached (S3), otherwise falls
    /// back to a public-endpoint URL.
    pub async fn download_link(
        &self,
        bucket: &str,
        object_name: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let path = Self::object_path(bucket, object_name);

        if let Some(signer) = &self.signer {
            let url = signer
                .signed_url(http::Method::GET, &path, ttl)
                .await
                .map_err(|e| StoreError::Sign(e.to_string()))?;
            return Ok(url.to_string());
        }

        match &self.public_endpoint {
            Some(endpoint) => Ok(format!("{}/{}", endpoint.trim_end_matches('/'), path)),
            None => Err(StoreError::Sign(
                "no signing backend or public endpoint configured".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::document::{BUCKET_POSTPROCESSING, BUCKET_PREPROCESSING};

    fn memory_store() -> DocumentStore {
        DocumentStore::new(backend::create_memory_store())
            .with_public_endpoint("http://localhost:9000")
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = memory_store();
        let body = Bytes::from_static(b"%PDF-1.4 test");

        store
            .put(BUCKET_PREPROCESSING, "doc.pdf", body.clone(), None)
            .await
            .unwrap();

        let fetched = store.get(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap();
        assert_eq!(fetched, body);
    }

    #[tokio::test]
    async fn test_second_put_fails_with_already_exists() {
        let store = memory_store();
        let body = Bytes::from_static(b"original bytes");

        store
            .put(BUCKET_PREPROCESSING, "doc.pdf", body.clone(), None)
            .await
            .unwrap();

        let result = store
            .put(
                BUCKET_PREPROCESSING,
                "doc.pdf",
                Bytes::from_static(b"other bytes"),
                None,
            )
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));

        // No bytes were altered.
        let fetched = store.get(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap();
        assert_eq!(fetched, body);
    }

    #[tokio::test]
    async fn test_get_missing_object_is_not_found() {
        let store = memory_store();
        let result = store.get(BUCKET_PREPROCESSING, "missing.pdf").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_exists_distinguishes_absence() {
        let store = memory_store();

        assert!(!store.exists(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap());

        store
            .put(
                BUCKET_PREPROCESSING,
                "doc.pdf",
                Bytes::from_static(b"x"),
                None,
            )
            .await
            .unwrap();

        assert!(store.exists(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = memory_store();

        store
            .put(
                BUCKET_PREPROCESSING,
                "doc.pdf",
                Bytes::from_static(b"x"),
                None,
            )
            .await
            .unwrap();

        store.remove(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap();
        // Removing again must not error.
        store.remove(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn test_move_leaves_object_only_at_destination() {
        let store = memory_store();
        let body = Bytes::from_static(b"payload");

        store
            .put(BUCKET_PREPROCESSING, "doc.pdf", body.clone(), None)
            .await
            .unwrap();

        let new_path = store
            .move_object("doc.pdf", BUCKET_PREPROCESSING, BUCKET_POSTPROCESSING, "")
            .await
            .unwrap();

        assert_eq!(new_path, "postprocessing/doc.pdf");
        assert!(!store.exists(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap());
        let fetched = store.get(BUCKET_POSTPROCESSING, "doc.pdf").await.unwrap();
        assert_eq!(fetched, body);
    }

    #[tokio::test]
    async fn test_move_with_subpath() {
        let store = memory_store();

        store
            .put(
                BUCKET_PREPROCESSING,
                "doc.pdf",
                Bytes::from_static(b"payload"),
                None,
            )
            .await
            .unwrap();

        let new_path = store
            .move_object(
                "doc.pdf",
                BUCKET_PREPROCESSING,
                BUCKET_POSTPROCESSING,
                "archive",
            )
            .await
            .unwrap();

        assert_eq!(new_path, "postprocessing/archive/doc.pdf");
        assert!(store
            .exists(BUCKET_POSTPROCESSING, "archive/doc.pdf")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_move_converges_when_destination_exists() {
        let store = memory_store();
        let body = Bytes::from_static(b"payload");

        // Simulate a crash between put and remove: object in both buckets.
        store
            .put(BUCKET_PREPROCESSING, "doc.pdf", body.clone(), None)
            .await
            .unwrap();
        store
            .put(BUCKET_POSTPROCESSING, "doc.pdf", body.clone(), None)
            .await
            .unwrap();

        let new_path = store
            .move_object("doc.pdf", BUCKET_PREPROCESSING, BUCKET_POSTPROCESSING, "")
            .await
            .unwrap();

        assert_eq!(new_path, "postprocessing/doc.pdf");
        assert!(!store.exists(BUCKET_PREPROCESSING, "doc.pdf").await.unwrap());
        assert!(store
            .exists(BUCKET_POSTPROCESSING, "doc.pdf")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_download_link_falls_back_to_public_endpoint() {
        let store = memory_store();
        let link = store
            .download_link(BUCKET_POSTPROCESSING, "doc.pdf", Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(link, "http://localhost:9000/postprocessing/doc.pdf");
    }

    #[tokio::test]
    async fn test_download_link_requires_some_backend() {
        let store = DocumentStore::new(backend::create_memory_store());
        let result = store
            .download_link(BUCKET_POSTPROCESSING, "doc.pdf", Duration::from_secs(900))
            .await;
        assert!(matches!(result, Err(StoreError::Sign(_))));
    }

    #[tokio::test]
    async fn test_create_bucket_is_idempotent() {
        let store = memory_store();
        store.create_bucket(BUCKET_PREPROCESSING).await.unwrap();
        store.create_bucket(BUCKET_PREPROCESSING).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_succeeds_against_memory_store() {
        let store = memory_store();
        let retry = ConnectRetry {
            attempts: 2,
            delay: Duration::from_millis(10),
        };
        store.init(&retry).await.unwrap();
    }
}
