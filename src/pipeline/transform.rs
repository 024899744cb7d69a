//! Transform stage: consume work items, anonymize, emit completions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::anonymizer::DocumentTransformer;
use crate::broker::{HandlerError, MessageBroker, MessageHandler};
use crate::error::StoreError;
use crate::store::DocumentStore;

use super::document::{
    DocumentMessage, BUCKET_POSTPROCESSING, BUCKET_PREPROCESSING, DOCUMENT_EXCHANGE,
    OUT_ROUTING_KEY,
};

/// Consumer of the in-queue: anonymizes each submitted document and
/// publishes a completion event to the out-queue.
pub struct TransformService {
    store: Arc<DocumentStore>,
    broker: Arc<dyn MessageBroker>,
    anonymizer: Arc<dyn DocumentTransformer>,
}

impl TransformService {
    pub fn new(
        store: Arc<DocumentStore>,
        broker: Arc<dyn MessageBroker>,
        anonymizer: Arc<dyn DocumentTransformer>,
    ) -> Self {
        Self {
            store,
            broker,
            anonymizer,
        }
    }
}

#[async_trait]
impl MessageHandler for TransformService {
    /// Processes one work item.
    ///
    /// Anonymizer failures are terminal for the document: a `failed`
    /// completion is published and the original stays in the
    /// pre-processing bucket for inspection. Storage failures are returned
    /// to the consume loop, which redelivers the message; the
    /// destination-existence check keeps redelivered messages convergent.
    async fn handle(&self, message: DocumentMessage) -> Result<(), HandlerError> {
        let object_key = message.object_key();

        let original = self
            .store
            .get(BUCKET_PREPROCESSING, &object_key)
            .await
            .map_err(HandlerError::from)?;

        match self
            .anonymizer
            .transform(original, &message.original_file_name)
            .await
        {
            Ok(result) => {
                let already_stored = self
                    .store
                    .exists(BUCKET_POSTPROCESSING, &object_key)
                    .await
                    .map_err(HandlerError::from)?;

                if !already_stored {
                    match self
                        .store
                        .put(BUCKET_POSTPROCESSING, &object_key, result, None)
                        .await
                    {
                        Ok(()) => {}
                        // Lost a race with a redelivered copy; converge.
                        Err(StoreError::AlreadyExists { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }

                self.store
                    .remove(BUCKET_PREPROCESSING, &object_key)
                    .await
                    .map_err(HandlerError::from)?;

                let completion = DocumentMessage::anonymized(
                    &message,
                    format!("{BUCKET_POSTPROCESSING}/{object_key}"),
                );
                self.broker
                    .publish(DOCUMENT_EXCHANGE, OUT_ROUTING_KEY, &completion)
                    .await
                    .map_err(HandlerError::from)?;

                info!(
                    document_id = %message.document_id,
                    session_id = %message.session_id,
                    "Document anonymized"
                );
            }
            Err(e) => {
                warn!(
                    document_id = %message.document_id,
                    session_id = %message.session_id,
                    error = %e,
                    "Anonymization failed, original left in place"
                );

                let completion = DocumentMessage::failed(&message, e.to_string());
                self.broker
                    .publish(DOCUMENT_EXCHANGE, OUT_ROUTING_KEY, &completion)
                    .await
                    .map_err(HandlerError::from)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::broker::{InMemoryBroker, MessageHandler};
    use crate::error::AnonymizerError;
    use crate::pipeline::document::{DocumentStatus, IN_ROUTING_KEY, IN_QUEUE, OUT_QUEUE};
    use crate::store::backend::create_memory_store;

    /// Transformer that uppercases bytes, or fails when told to.
    struct FakeAnonymizer {
        fail_with: Option<String>,
    }

    #[async_trait]
    impl DocumentTransformer for FakeAnonymizer {
        async fn transform(
            &self,
            document: Bytes,
            _file_name: &str,
        ) -> Result<Bytes, AnonymizerError> {
            match &self.fail_with {
                Some(detail) => Err(AnonymizerError::Transform {
                    status: 500,
                    detail: detail.clone(),
                }),
                None => Ok(Bytes::from(document.to_ascii_uppercase())),
            }
        }
    }

    struct Capture(Mutex<Vec<DocumentMessage>>);

    #[async_trait]
    impl MessageHandler for Capture {
        async fn handle(&self, message: DocumentMessage) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    async fn setup(
        fail_with: Option<String>,
    ) -> (Arc<DocumentStore>, Arc<InMemoryBroker>, TransformService) {
        let store = Arc::new(DocumentStore::new(create_memory_store()));
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange(DOCUMENT_EXCHANGE).await.unwrap();
        broker
            .declare_queue(IN_QUEUE, DOCUMENT_EXCHANGE, IN_ROUTING_KEY)
            .await
            .unwrap();
        broker
            .declare_queue(OUT_QUEUE, DOCUMENT_EXCHANGE, OUT_ROUTING_KEY)
            .await
            .unwrap();

        let service = TransformService::new(
            Arc::clone(&store),
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            Arc::new(FakeAnonymizer { fail_with }),
        );
        (store, broker, service)
    }

    async fn drain_out_queue(broker: &Arc<InMemoryBroker>) -> Vec<DocumentMessage> {
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let consumer = {
            let broker = Arc::clone(broker);
            let handler: Arc<dyn MessageHandler> = capture.clone();
            tokio::spawn(async move { broker.consume(OUT_QUEUE, handler, shutdown_rx).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        consumer.await.unwrap().unwrap();

        let messages = capture.0.lock().unwrap().clone();
        messages
    }

    fn submitted(document_id: &str) -> DocumentMessage {
        DocumentMessage::submitted(
            "sess-1",
            document_id,
            format!("{BUCKET_PREPROCESSING}/{document_id}.pdf"),
            "report.pdf",
        )
    }

    #[tokio::test]
    async fn test_happy_path_stores_result_and_publishes_completion() {
        let (store, broker, service) = setup(None).await;

        store
            .put(
                BUCKET_PREPROCESSING,
                "doc-1.pdf",
                Bytes::from_static(b"secret"),
                None,
            )
            .await
            .unwrap();

        service.handle(submitted("doc-1")).await.unwrap();

        // Result stored, original removed.
        let result = store.get(BUCKET_POSTPROCESSING, "doc-1.pdf").await.unwrap();
        assert_eq!(result, Bytes::from_static(b"SECRET"));
        assert!(!store.exists(BUCKET_PREPROCESSING, "doc-1.pdf").await.unwrap());

        // Completion event points at the destination.
        let completions = drain_out_queue(&broker).await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, Some(DocumentStatus::Anonymized));
        assert_eq!(completions[0].s3_path, "postprocessing/doc-1.pdf");
        assert_eq!(completions[0].original_file_name, "report.pdf");
    }

    #[tokio::test]
    async fn test_anonymizer_failure_leaves_original_in_place() {
        let (store, broker, service) = setup(Some("model unavailable".to_string())).await;

        store
            .put(
                BUCKET_PREPROCESSING,
                "doc-2.pdf",
                Bytes::from_static(b"secret"),
                None,
            )
            .await
            .unwrap();

        service.handle(submitted("doc-2")).await.unwrap();

        // Original retrievable, nothing in the post-processing bucket.
        assert!(store.exists(BUCKET_PREPROCESSING, "doc-2.pdf").await.unwrap());
        assert!(!store
            .exists(BUCKET_POSTPROCESSING, "doc-2.pdf")
            .await
            .unwrap());

        let completions = drain_out_queue(&broker).await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, Some(DocumentStatus::Failed));
        assert!(completions[0]
            .failure_reason()
            .unwrap()
            .contains("model unavailable"));
    }

    #[tokio::test]
    async fn test_missing_original_surfaces_to_consume_loop() {
        let (_store, _broker, service) = setup(None).await;

        let result = service.handle(submitted("ghost")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_redelivered_message_converges() {
        let (store, broker, service) = setup(None).await;

        store
            .put(
                BUCKET_PREPROCESSING,
                "doc-3.pdf",
                Bytes::from_static(b"secret"),
                None,
            )
            .await
            .unwrap();
        // A previous partial run already stored the result.
        store
            .put(
                BUCKET_POSTPROCESSING,
                "doc-3.pdf",
                Bytes::from_static(b"SECRET"),
                None,
            )
            .await
            .unwrap();

        service.handle(submitted("doc-3")).await.unwrap();

        assert!(!store.exists(BUCKET_PREPROCESSING, "doc-3.pdf").await.unwrap());
        assert!(store
            .exists(BUCKET_POSTPROCESSING, "doc-3.pdf")
            .await
            .unwrap());

        let completions = drain_out_queue(&broker).await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, Some(DocumentStatus::Anonymized));
    }
}
