//! Redis-backed message broker.
//!
//! Topology is kept in Redis alongside the queues themselves:
//!
//! - `mq:exchanges`: set of declared exchange names
//! - `mq:exchange:{exchange}:bind:{routing_key}`: set of bound queue names
//! - `mq:queue:{queue}`: main queue (LPUSH in, BRPOPLPUSH out, FIFO)
//! - `mq:queue:{queue}:processing`: messages being handled (crash recovery)
//! - `mq:queue:{queue}:dead_letter`: messages that exhausted their attempts
//!
//! # Reliability
//!
//! Dequeue atomically moves a message into the processing list; it is
//! removed on handler success and requeued or dead-lettered on failure, so
//! a consumer crash never loses an in-flight message.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ConnectRetry;
use crate::pipeline::document::DocumentMessage;

use super::{BrokerError, MessageBroker, MessageHandler, DEFAULT_MAX_ATTEMPTS};

/// How long a blocking dequeue waits before re-checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn exchanges_key() -> String {
    "mq:exchanges".to_string()
}

fn binding_key(exchange: &str, routing_key: &str) -> String {
    format!("mq:exchange:{exchange}:bind:{routing_key}")
}

fn queue_key(queue: &str) -> String {
    format!("mq:queue:{queue}")
}

fn processing_key(queue: &str) -> String {
    format!("mq:queue:{queue}:processing")
}

fn dead_letter_key(queue: &str) -> String {
    format!("mq:queue:{queue}:dead_letter")
}

/// Redis-backed implementation of [`MessageBroker`].
///
/// The connection manager reconnects automatically after transient drops;
/// the initial connection uses the bounded-retry policy and surfaces
/// exhaustion as [`BrokerError::Connect`] so startup can abort instead of
/// continuing without a usable broker.
pub struct RedisBroker {
    redis: ConnectionManager,
    retry: ConnectRetry,
    max_attempts: u32,
}

impl RedisBroker {
    /// Connects to Redis, retrying within the given budget.
    pub async fn connect(redis_url: &str, retry: ConnectRetry) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(|e| BrokerError::Connect {
            attempts: 0,
            detail: e.to_string(),
        })?;

        let mut last_err = None;
        for attempt in 1..=retry.attempts {
            match ConnectionManager::new(client.clone()).await {
                Ok(redis) => {
                    info!(attempt, "Broker connection established");
                    return Ok(Self {
                        redis,
                        retry,
                        max_attempts: DEFAULT_MAX_ATTEMPTS,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Broker connection attempt failed");
                    last_err = Some(e);
                    if attempt < retry.attempts {
                        tokio::time::sleep(retry.delay).await;
                    }
                }
            }
        }

        Err(BrokerError::Connect {
            attempts: retry.attempts,
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Sets the delivery-attempt bound before dead-lettering.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Dequeues the next raw payload, blocking up to `POLL_INTERVAL`.
    ///
    /// BRPOPLPUSH atomically moves the payload into the processing list.
    async fn dequeue(&self, queue: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let timeout_secs = POLL_INTERVAL.as_secs().max(1) as usize;

        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(queue_key(queue))
            .arg(processing_key(queue))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(raw)
    }

    /// Removes a handled payload from the processing list.
    async fn ack(&self, queue: &str, raw: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(processing_key(queue), 1, raw).await?;
        Ok(())
    }

    /// Puts a failed message back at the front of the main queue.
    async fn requeue(&self, queue: &str, message: &DocumentMessage) -> Result<(), BrokerError> {
        let serialized = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(queue_key(queue), serialized).await?;
        Ok(())
    }

    /// Records a message that exhausted its attempts, with the final error.
    async fn dead_letter(
        &self,
        queue: &str,
        message: &DocumentMessage,
        error: &str,
    ) -> Result<(), BrokerError> {
        let entry = serde_json::json!({
            "message": message,
            "error": error,
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(dead_letter_key(queue), serialized)
            .await?;
        Ok(())
    }

    /// Recovers messages stranded in the processing list by a crashed
    /// consumer. Returns the number of messages put back on the queue.
    async fn recover_processing(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let stranded: Vec<String> = conn.lrange(processing_key(queue), 0, -1).await?;
        for raw in stranded {
            match serde_json::from_str::<DocumentMessage>(&raw) {
                Ok(mut message) => {
                    message.record_attempt();
                    if message.delivery_attempts() < self.max_attempts {
                        let serialized = serde_json::to_string(&message)?;
                        let mut pipe = redis::pipe();
                        pipe.atomic()
                            .lrem(processing_key(queue), 1, &raw)
                            .rpush(queue_key(queue), &serialized);
                        pipe.query_async::<_, ()>(&mut conn).await?;
                        recovered += 1;
                    } else {
                        self.dead_letter(queue, &message, "recovered after max attempts")
                            .await?;
                        conn.lrem::<_, _, ()>(processing_key(queue), 1, &raw).await?;
                    }
                }
                Err(e) => {
                    warn!(queue, error = %e, "Dropping unparsable payload from processing list");
                    conn.lrem::<_, _, ()>(processing_key(queue), 1, &raw).await?;
                }
            }
        }

        Ok(recovered)
    }

    /// Decodes and dispatches one raw payload, then settles it.
    async fn dispatch(&self, queue: &str, raw: String, handler: &Arc<dyn MessageHandler>) {
        let message: DocumentMessage = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(queue, error = %e, "Failed to decode queue payload, dropping message");
                if let Err(ack_err) = self.ack(queue, &raw).await {
                    error!(queue, error = %ack_err, "Failed to drop malformed payload");
                }
                return;
            }
        };

        let outcome = handler.handle(message.clone()).await;

        if let Err(ack_err) = self.ack(queue, &raw).await {
            error!(
                queue,
                document_id = %message.document_id,
                error = %ack_err,
                "Failed to acknowledge message"
            );
        }

        if let Err(handler_err) = outcome {
            let mut message = message;
            message.record_attempt();

            if message.delivery_attempts() < self.max_attempts {
                warn!(
                    queue,
                    document_id = %message.document_id,
                    attempts = message.delivery_attempts(),
                    error = %handler_err,
                    "Handler failed, requeueing message"
                );
                if let Err(e) = self.requeue(queue, &message).await {
                    error!(queue, error = %e, "Failed to requeue message");
                }
            } else {
                error!(
                    queue,
                    document_id = %message.document_id,
                    error = %handler_err,
                    "Handler failed, moving message to dead letter list"
                );
                if let Err(e) = self
                    .dead_letter(queue, &message, &handler_err.to_string())
                    .await
                {
                    error!(queue, error = %e, "Failed to dead-letter message");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageBroker for RedisBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(exchanges_key(), exchange).await?;
        debug!(exchange, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        // Transient failures share the connect retry budget.
        let mut last_err = None;
        for attempt in 1..=self.retry.attempts {
            let mut conn = self.redis.clone();
            let result = conn
                .sadd::<_, _, ()>(binding_key(exchange, routing_key), queue)
                .await;

            match result {
                Ok(()) => {
                    debug!(queue, exchange, routing_key, "Queue declared and bound");
                    return Ok(());
                }
                Err(e) => {
                    warn!(queue, attempt, error = %e, "Queue declaration attempt failed");
                    last_err = Some(e);
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        Err(last_err.map(BrokerError::Redis).unwrap_or_else(|| {
            BrokerError::Queue(format!("failed to declare queue '{queue}'"))
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &DocumentMessage,
    ) -> Result<(), BrokerError> {
        let serialized = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();

        let queues: Vec<String> = conn.smembers(binding_key(exchange, routing_key)).await?;
        if queues.is_empty() {
            debug!(exchange, routing_key, "No queue bound, dropping message");
            return Ok(());
        }

        for queue in &queues {
            conn.lpush::<_, _, ()>(queue_key(queue), &serialized).await?;
        }

        debug!(
            exchange,
            routing_key,
            document_id = %message.document_id,
            "Message published"
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), BrokerError> {
        match self.recover_processing(queue).await {
            Ok(recovered) if recovered > 0 => {
                info!(queue, recovered, "Recovered messages from processing list");
            }
            Ok(_) => {}
            Err(e) => warn!(queue, error = %e, "Failed to recover processing list"),
        }

        info!(queue, "Consumer started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(queue, "Consumer received shutdown signal");
                    break;
                }
                dequeued = self.dequeue(queue) => match dequeued {
                    Ok(Some(raw)) => self.dispatch(queue, raw, &handler).await,
                    Ok(None) => {}
                    Err(e) => {
                        error!(queue, error = %e, "Failed to dequeue message");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                },
            }
        }

        Ok(())
    }
}
