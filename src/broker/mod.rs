//! Message broker abstraction for the document pipeline.
//!
//! Every stage hands work to the next one through a broker implementing
//! [`MessageBroker`]: a durable direct-routed exchange, named queues bound
//! by routing key, fire-and-forget publish, and a blocking consume loop
//! that feeds a [`MessageHandler`].
//!
//! # Delivery semantics
//!
//! Consumption is receive → process → acknowledge-on-success. A dequeued
//! message sits in a per-queue processing list until its handler returns;
//! handler failure requeues it up to a bounded attempt count and then moves
//! it to a dead-letter list with the error text. Malformed payloads are
//! logged and dropped. Messages stranded in the processing list by a
//! crashed consumer are recovered into the main queue on startup.

mod memory;
mod redis;

pub use self::memory::InMemoryBroker;
pub use self::redis::RedisBroker;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::pipeline::document::DocumentMessage;

/// Default number of delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker was unreachable after the retry budget.
    #[error("Broker connection failed after {attempts} attempts: {detail}")]
    Connect { attempts: u32, detail: String },

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Failed to serialize or deserialize a wire payload.
    #[error("Payload serialization failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// The queue has not been declared, or already has a consumer.
    #[error("Queue error: {0}")]
    Queue(String),
}

/// Error returned by a [`MessageHandler`].
///
/// Handlers collapse their domain errors into this type; the consume loop
/// only needs the text for logging and dead-letter records.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

impl From<crate::error::StoreError> for HandlerError {
    fn from(err: crate::error::StoreError) -> Self {
        Self(err.to_string())
    }
}

impl From<BrokerError> for HandlerError {
    fn from(err: BrokerError) -> Self {
        Self(err.to_string())
    }
}

/// Callback invoked once per received message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: DocumentMessage) -> Result<(), HandlerError>;
}

/// Capability set every pipeline stage uses to hand off work.
///
/// Implementations are safe for concurrent use by multiple callers; no
/// caller-side locking is required.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Idempotently declares a durable, direct-routed exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Idempotently declares a durable queue and binds it to `exchange`
    /// under `routing_key`.
    async fn declare_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes a message to every queue bound under `routing_key`.
    ///
    /// Fire-and-forget: errors are surfaced to the caller and never retried
    /// internally. A routing key with no bound queue drops the message,
    /// matching direct-exchange semantics.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &DocumentMessage,
    ) -> Result<(), BrokerError>;

    /// Consumes `queue`, invoking `handler` once per message.
    ///
    /// Blocks the calling task until `shutdown` fires.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), BrokerError>;
}
