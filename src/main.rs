//! docflow service entry point.
//!
//! Wires the pipeline together: object store and broker (both with
//! bounded-retry connects that abort startup on exhaustion), the transform
//! consumer, the completion consumer feeding the delivery pool, and the
//! HTTP surface. Shutdown is a broadcast signal observed by every loop;
//! the pool is drained after the consumers stop.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docflow::anonymizer::HttpAnonymizer;
use docflow::api::{self, AppState};
use docflow::broker::{MessageBroker, MessageHandler, RedisBroker};
use docflow::config::AppConfig;
use docflow::notify::{CompletionDispatcher, DeliveryPool, NotificationHub, Notifier};
use docflow::pipeline::document::{
    BUCKET_POSTPROCESSING, BUCKET_PREPROCESSING, DOCUMENT_EXCHANGE, IN_QUEUE, IN_ROUTING_KEY,
    OUT_QUEUE, OUT_ROUTING_KEY,
};
use docflow::pipeline::{IngestService, TransformService};
use docflow::store::backend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = docflow::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let config = AppConfig::from_env()?;

    // Storage and broker connect with a bounded retry budget; exhaustion
    // aborts startup instead of limping on without a usable backend.
    let store = Arc::new(backend::create_document_store(&config.storage)?);
    store.init(&config.connect_retry).await?;
    store.create_bucket(BUCKET_PREPROCESSING).await?;
    store.create_bucket(BUCKET_POSTPROCESSING).await?;

    let broker = Arc::new(
        RedisBroker::connect(&config.redis_url, config.connect_retry)
            .await?
            .with_max_attempts(config.max_delivery_attempts),
    );

    broker.declare_exchange(DOCUMENT_EXCHANGE).await?;
    broker
        .declare_queue(IN_QUEUE, DOCUMENT_EXCHANGE, IN_ROUTING_KEY)
        .await?;
    broker
        .declare_queue(OUT_QUEUE, DOCUMENT_EXCHANGE, OUT_ROUTING_KEY)
        .await?;

    let anonymizer = Arc::new(HttpAnonymizer::new(
        &config.anonymizer_url,
        config.anonymizer_timeout,
    )?);

    let hub = Arc::new(NotificationHub::new());
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        config.download_link_ttl,
    ));
    let pool = Arc::new(DeliveryPool::new(
        config.max_workers,
        config.worker_lifetime,
        notifier,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    // Transform stage: in-queue consumer.
    let transform_task = {
        let broker_handle: Arc<dyn MessageBroker> = Arc::clone(&broker) as _;
        let handler: Arc<dyn MessageHandler> = Arc::new(TransformService::new(
            Arc::clone(&store),
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            anonymizer,
        ));
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { broker_handle.consume(IN_QUEUE, handler, shutdown_rx).await })
    };

    // Delivery stage: out-queue consumer feeding the worker pool.
    let dispatch_task = {
        let broker_handle: Arc<dyn MessageBroker> = Arc::clone(&broker) as _;
        let handler: Arc<dyn MessageHandler> =
            Arc::new(CompletionDispatcher::new(Arc::clone(&pool)));
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { broker_handle.consume(OUT_QUEUE, handler, shutdown_rx).await })
    };

    // HTTP surface.
    let ingest = Arc::new(IngestService::new(
        Arc::clone(&store),
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
    ));
    let app = api::router(AppState {
        ingest,
        hub: Arc::clone(&hub),
    });
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "docflow listening");

    // Translate Ctrl-C into the shared shutdown signal.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let mut server_shutdown = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.recv().await;
        })
        .await?;

    // Consumers exit on the same signal; let in-flight jobs finish.
    for (name, task) in [("transform", transform_task), ("dispatch", dispatch_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(consumer = name, error = %e, "Consumer exited with error"),
            Err(e) => error!(consumer = name, error = %e, "Consumer task panicked"),
        }
    }
    pool.drain_and_wait().await;

    info!("docflow stopped");
    Ok(())
}
