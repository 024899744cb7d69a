//! Object store backends.
//!
//! Builders for the concrete [`ObjectStore`] implementations the pipeline
//! can run against: an S3-compatible endpoint (MinIO works), a local
//! filesystem root, and the in-memory store used by tests.

use std::sync::Arc;
use std::time::Duration;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::signer::Signer;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use tracing::info;

use crate::config::StorageConfig;
use crate::error::StoreError;

/// Client options shared by the remote backends.
fn create_client_options(allow_http: bool) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(30))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_allow_http(allow_http)
}

/// Retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Creates an S3 client for the configured bucket.
///
/// Returns the store together with its signing handle for presigned
/// download references.
pub fn create_s3_store(
    config: &StorageConfig,
) -> Result<(Arc<dyn ObjectStore>, Arc<dyn Signer>), StoreError> {
    info!(bucket = %config.bucket, "Creating S3 client");

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&config.bucket)
        .with_region(&config.region)
        .with_access_key_id(&config.access_key_id)
        .with_secret_access_key(&config.secret_access_key)
        .with_client_options(create_client_options(config.allow_http))
        .with_retry(create_retry_config())
        .with_virtual_hosted_style_request(false);

    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if config.allow_http {
        builder = builder.with_allow_http(true);
    }

    let s3 = Arc::new(
        builder
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?,
    );

    Ok((Arc::clone(&s3) as Arc<dyn ObjectStore>, s3 as Arc<dyn Signer>))
}

/// Creates a store rooted at a local directory, creating it if needed.
pub fn create_local_store(root: &std::path::Path) -> Result<Arc<dyn ObjectStore>, StoreError> {
    if !root.exists() {
        std::fs::create_dir_all(root).map_err(|e| StoreError::Transport(e.to_string()))?;
    }
    info!(root = %root.display(), "Creating local filesystem store");

    let store =
        LocalFileSystem::new_with_prefix(root).map_err(|e| StoreError::Transport(e.to_string()))?;
    Ok(Arc::new(store))
}

/// Creates an in-memory store for tests and ephemeral runs.
pub fn create_memory_store() -> Arc<dyn ObjectStore> {
    Arc::new(InMemory::new())
}

/// Builds the [`crate::store::DocumentStore`] selected by `config`.
///
/// A configured `local_root` takes precedence over S3, mirroring the way
/// deployments switch backends without code changes.
pub fn create_document_store(config: &StorageConfig) -> Result<crate::store::DocumentStore, StoreError> {
    match &config.local_root {
        Some(root) => {
            let store = create_local_store(root)?;
            let mut document_store = crate::store::DocumentStore::new(store);
            if let Some(endpoint) = &config.public_endpoint {
                document_store = document_store.with_public_endpoint(endpoint);
            }
            Ok(document_store)
        }
        None => {
            let (store, signer) = create_s3_store(config)?;
            let mut document_store = crate::store::DocumentStore::new(store).with_signer(signer);
            if let Some(endpoint) = &config.public_endpoint {
                document_store = document_store.with_public_endpoint(endpoint);
            }
            Ok(document_store)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_config() -> StorageConfig {
        StorageConfig {
            local_root: None,
            endpoint: Some("http://localhost:9000".to_string()),
            region: "us-east-1".to_string(),
            bucket: "docflow".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            allow_http: true,
            public_endpoint: Some("http://localhost:9000".to_string()),
        }
    }

    #[test]
    fn test_create_s3_store() {
        let result = create_s3_store(&s3_config());
        assert!(result.is_ok());
    }

    #[test]
    fn test_create_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let result = create_local_store(dir.path());
        assert!(result.is_ok());
    }

    #[test]
    fn test_create_local_store_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("store/objects");
        let result = create_local_store(&nested);
        assert!(result.is_ok());
        assert!(nested.exists());
    }

    #[test]
    fn test_create_document_store_prefers_local_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = s3_config();
        config.local_root = Some(dir.path().to_path_buf());
        assert!(create_document_store(&config).is_ok());
    }
}
