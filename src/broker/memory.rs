//! In-process message broker.
//!
//! Implements the same topology and delivery contract as the Redis backend
//! over tokio channels. Used by the integration tests and suitable for
//! single-node deployments where an external broker is overkill.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::pipeline::document::DocumentMessage;

use super::{BrokerError, MessageBroker, MessageHandler, DEFAULT_MAX_ATTEMPTS};

/// A message that exhausted its delivery attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub message: DocumentMessage,
    pub error: String,
}

struct QueueChannel {
    tx: mpsc::UnboundedSender<String>,
    // Taken by the first consumer; a queue supports one consumer at a time.
    rx: Option<mpsc::UnboundedReceiver<String>>,
}

#[derive(Default)]
struct BrokerState {
    // exchange -> routing_key -> bound queue names
    bindings: HashMap<String, HashMap<String, Vec<String>>>,
    queues: HashMap<String, QueueChannel>,
}

/// In-memory implementation of [`MessageBroker`].
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    max_attempts: u32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            dead_letters: Mutex::new(Vec::new()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the delivery-attempt bound before dead-lettering.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Messages that exhausted their attempts, for inspection.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().expect("lock poisoned").clone()
    }

    fn sender(&self, queue: &str) -> Result<mpsc::UnboundedSender<String>, BrokerError> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .queues
            .get(queue)
            .map(|q| q.tx.clone())
            .ok_or_else(|| BrokerError::Queue(format!("no such queue '{queue}'")))
    }

    async fn dispatch(&self, queue: &str, raw: String, handler: &Arc<dyn MessageHandler>) {
        let message: DocumentMessage = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(queue, error = %e, "Failed to decode queue payload, dropping message");
                return;
            }
        };

        if let Err(handler_err) = handler.handle(message.clone()).await {
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
                if let Ok(tx) = self.sender(queue) {
                    if let Ok(serialized) = serde_json::to_string(&message) {
                        let _ = tx.send(serialized);
                    }
                }
            } else {
                warn!(
                    queue,
                    document_id = %message.document_id,
                    error = %handler_err,
                    "Handler failed, moving message to dead letters"
                );
                self.dead_letters.lock().expect("lock poisoned").push(DeadLetter {
                    queue: queue.to_string(),
                    message,
                    error: handler_err.to_string(),
                });
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.bindings.entry(exchange.to_string()).or_default();
        debug!(exchange, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("lock poisoned");

        if !state.queues.contains_key(queue) {
            let (tx, rx) = mpsc::unbounded_channel();
            state
                .queues
                .insert(queue.to_string(), QueueChannel { tx, rx: Some(rx) });
        }

        let bound = state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .entry(routing_key.to_string())
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }

        debug!(queue, exchange, routing_key, "Queue declared and bound");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &DocumentMessage,
    ) -> Result<(), BrokerError> {
        let serialized = serde_json::to_string(message)?;

        let senders: Vec<mpsc::UnboundedSender<String>> = {
            let state = self.state.lock().expect("lock poisoned");
            let bound = state
                .bindings
                .get(exchange)
                .and_then(|routes| routes.get(routing_key));
            match bound {
                Some(queues) => queues
                    .iter()
                    .filter_map(|q| state.queues.get(q).map(|c| c.tx.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        if senders.is_empty() {
            debug!(exchange, routing_key, "No queue bound, dropping message");
            return Ok(());
        }

        for tx in senders {
            let _ = tx.send(serialized.clone());
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), BrokerError> {
        let mut rx = {
            let mut state = self.state.lock().expect("lock poisoned");
            let channel = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Queue(format!("no such queue '{queue}'")))?;
            channel
                .rx
                .take()
                .ok_or_else(|| BrokerError::Queue(format!("queue '{queue}' already has a consumer")))?
        };

        info!(queue, "Consumer started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(queue, "Consumer received shutdown signal");
                    break;
                }
                raw = rx.recv() => match raw {
                    Some(raw) => self.dispatch(queue, raw, &handler).await,
                    None => break,
                },
            }
        }

        Ok(())
    }
}
