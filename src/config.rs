//! Application configuration.
//!
//! Configuration is read from environment variables into an explicit
//! `AppConfig` that is constructed once in `main` and passed down to the
//! components that need it. There is no global configuration state.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Bounded-retry policy for initial broker and store connections.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRetry {
    /// Maximum number of connection attempts.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

/// Object-store backend settings.
///
/// When `local_root` is set the store runs against the local filesystem;
/// otherwise the S3 fields select the remote backend.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Local filesystem root; takes precedence over S3 when set.
    pub local_root: Option<PathBuf>,
    /// S3-compatible endpoint (e.g. a MinIO instance).
    pub endpoint: Option<String>,
    /// Region for the S3 backend.
    pub region: String,
    /// Backing bucket name; pipeline buckets are prefixes within it.
    pub bucket: String,
    /// Static credentials.
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Allow plain-HTTP endpoints (local MinIO).
    pub allow_http: bool,
    /// Base URL used for download links when the backend cannot sign.
    pub public_endpoint: Option<String>,
}

/// Configuration for the docflow service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the HTTP surface listens on.
    pub listen_addr: SocketAddr,
    /// Redis connection URL for the broker.
    pub redis_url: String,
    /// Full URL of the anonymizer transform endpoint.
    pub anonymizer_url: String,
    /// Timeout for a single anonymizer call.
    pub anonymizer_timeout: Duration,
    /// Object-store backend settings.
    pub storage: StorageConfig,
    /// Ceiling on concurrently active delivery workers.
    pub max_workers: usize,
    /// Lifetime budget of a single delivery worker.
    pub worker_lifetime: Duration,
    /// Validity window of presigned download references.
    pub download_link_ttl: Duration,
    /// Delivery attempts before a message is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Bounded-retry policy for initial connections.
    pub connect_retry: ConnectRetry,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().expect("valid default address"),
            redis_url: "redis://localhost:6379".to_string(),
            anonymizer_url: "http://localhost:8000/anonymize".to_string(),
            anonymizer_timeout: Duration::from_secs(120),
            storage: StorageConfig {
                local_root: None,
                endpoint: Some("http://localhost:9000".to_string()),
                region: "us-east-1".to_string(),
                bucket: "docflow".to_string(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                allow_http: true,
                public_endpoint: Some("http://localhost:9000".to_string()),
            },
            max_workers: 10,
            worker_lifetime: Duration::from_secs(900), // 15 minutes
            download_link_ttl: Duration::from_secs(900),
            max_delivery_attempts: 3,
            connect_retry: ConnectRetry::default(),
        }
    }
}

impl AppConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DOCFLOW_LISTEN_ADDR`: HTTP listen address (default: 0.0.0.0:8080)
    /// - `DOCFLOW_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `DOCFLOW_ANONYMIZER_URL`: anonymizer endpoint
    ///   (default: http://localhost:8000/anonymize)
    /// - `DOCFLOW_ANONYMIZER_TIMEOUT_SECS`: anonymizer call timeout (default: 120)
    /// - `DOCFLOW_STORAGE_LOCAL_ROOT`: local store root; disables S3 when set
    /// - `DOCFLOW_S3_ENDPOINT`: S3-compatible endpoint (default: http://localhost:9000)
    /// - `DOCFLOW_S3_REGION`: S3 region (default: us-east-1)
    /// - `DOCFLOW_S3_BUCKET`: backing bucket (default: docflow)
    /// - `DOCFLOW_S3_ACCESS_KEY_ID` / `DOCFLOW_S3_SECRET_ACCESS_KEY`: credentials
    /// - `DOCFLOW_S3_ALLOW_HTTP`: allow plain-HTTP endpoints (default: true)
    /// - `DOCFLOW_PUBLIC_ENDPOINT`: base URL for unsigned download links
    /// - `DOCFLOW_MAX_WORKERS`: delivery worker ceiling (default: 10)
    /// - `DOCFLOW_WORKER_LIFETIME_SECS`: worker lifetime budget (default: 900)
    /// - `DOCFLOW_LINK_TTL_SECS`: download link validity (default: 900)
    /// - `DOCFLOW_MAX_DELIVERY_ATTEMPTS`: redelivery bound (default: 3)
    /// - `DOCFLOW_CONNECT_ATTEMPTS` / `DOCFLOW_CONNECT_DELAY_SECS`:
    ///   bounded-retry policy (default: 10 / 5)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DOCFLOW_LISTEN_ADDR") {
            config.listen_addr = parse_env_value(&val, "DOCFLOW_LISTEN_ADDR")?;
        }

        if let Ok(val) = std::env::var("DOCFLOW_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("DOCFLOW_ANONYMIZER_URL") {
            config.anonymizer_url = val;
        }

        if let Ok(val) = std::env::var("DOCFLOW_ANONYMIZER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCFLOW_ANONYMIZER_TIMEOUT_SECS")?;
            config.anonymizer_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DOCFLOW_STORAGE_LOCAL_ROOT") {
            config.storage.local_root = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("DOCFLOW_S3_ENDPOINT") {
            config.storage.endpoint = Some(val);
        }

        if let Ok(val) = std::env::var("DOCFLOW_S3_REGION") {
            config.storage.region = val;
        }

        if let Ok(val) = std::env::var("DOCFLOW_S3_BUCKET") {
            config.storage.bucket = val;
        }

        if let Ok(val) = std::env::var("DOCFLOW_S3_ACCESS_KEY_ID") {
            config.storage.access_key_id = val;
        }

        if let Ok(val) = std::env::var("DOCFLOW_S3_SECRET_ACCESS_KEY") {
            config.storage.secret_access_key = val;
        }

        if let Ok(val) = std::env::var("DOCFLOW_S3_ALLOW_HTTP") {
            config.storage.allow_http = parse_env_bool(&val, "DOCFLOW_S3_ALLOW_HTTP")?;
        }

        if let Ok(val) = std::env::var("DOCFLOW_PUBLIC_ENDPOINT") {
            config.storage.public_endpoint = Some(val);
        }

        if let Ok(val) = std::env::var("DOCFLOW_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "DOCFLOW_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("DOCFLOW_WORKER_LIFETIME_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCFLOW_WORKER_LIFETIME_SECS")?;
            config.worker_lifetime = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DOCFLOW_LINK_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCFLOW_LINK_TTL_SECS")?;
            config.download_link_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DOCFLOW_MAX_DELIVERY_ATTEMPTS") {
            config.max_delivery_attempts = parse_env_value(&val, "DOCFLOW_MAX_DELIVERY_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("DOCFLOW_CONNECT_ATTEMPTS") {
            config.connect_retry.attempts = parse_env_value(&val, "DOCFLOW_CONNECT_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("DOCFLOW_CONNECT_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCFLOW_CONNECT_DELAY_SECS")?;
            config.connect_retry.delay = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.anonymizer_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "anonymizer_url cannot be empty".to_string(),
            ));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.worker_lifetime.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_lifetime must be greater than 0".to_string(),
            ));
        }

        if self.download_link_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "download_link_ttl must be greater than 0".to_string(),
            ));
        }

        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_delivery_attempts must be greater than 0".to_string(),
            ));
        }

        if self.connect_retry.attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "connect_retry.attempts must be greater than 0".to_string(),
            ));
        }

        if self.storage.local_root.is_none() {
            if self.storage.bucket.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "storage.bucket cannot be empty".to_string(),
                ));
            }
            if self.storage.region.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "storage.region cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Builder method to set the worker ceiling.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Builder method to set the worker lifetime budget.
    pub fn with_worker_lifetime(mut self, lifetime: Duration) -> Self {
        self.worker_lifetime = lifetime;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the anonymizer endpoint.
    pub fn with_anonymizer_url(mut self, url: impl Into<String>) -> Self {
        self.anonymizer_url = url.into();
        self
    }

    /// Builder method to set the download link validity window.
    pub fn with_download_link_ttl(mut self, ttl: Duration) -> Self {
        self.download_link_ttl = ttl;
        self
    }

    /// Builder method to set the connect retry policy.
    pub fn with_connect_retry(mut self, retry: ConnectRetry) -> Self {
        self.connect_retry = retry;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
