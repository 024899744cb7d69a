//! Self-scaling worker pool for completion-event delivery.
//!
//! The pool grows workers lazily up to a ceiling and never shrinks below
//! zero active: each worker carries a bounded lifetime and exits when it
//! expires while the queue is idle, or when the job channel closes. A job
//! arriving after every worker has expired triggers a fresh spawn.
//!
//! The grow decision and the bounded channel send happen under one async
//! lock, so a submission can never slip between "no worker spawned" and
//! "channel has no receiver".

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pipeline::document::DocumentMessage;

/// Errors that can occur in the delivery pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been drained; no further submissions are permitted.
    #[error("Delivery pool is closed")]
    Closed,
}

/// Downstream action a worker runs for each completion event.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, message: DocumentMessage) -> Result<(), super::NotifyError>;
}

/// Self-scaling pool of delivery workers bounded by `max_workers`.
pub struct DeliveryPool {
    max_workers: usize,
    worker_lifetime: Duration,
    handler: Arc<dyn DeliveryHandler>,
    /// Serializes the grow decision with the bounded send.
    submit_gate: Mutex<Option<mpsc::Sender<DocumentMessage>>>,
    jobs_rx: Arc<Mutex<mpsc::Receiver<DocumentMessage>>>,
    active: Arc<AtomicUsize>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    worker_seq: AtomicU64,
}

impl DeliveryPool {
    /// Creates a pool delivering through `handler`.
    pub fn new(
        max_workers: usize,
        worker_lifetime: Duration,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(max_workers.max(1));

        Self {
            max_workers,
            worker_lifetime,
            handler,
            submit_gate: Mutex::new(Some(jobs_tx)),
            jobs_rx: Arc::new(Mutex::new(jobs_rx)),
            active: Arc::new(AtomicUsize::new(0)),
            handles: StdMutex::new(Vec::new()),
            worker_seq: AtomicU64::new(0),
        }
    }

    /// Submits a completion event for delivery.
    ///
    /// Spawns a fresh worker when the active count is below the ceiling,
    /// then hands the job to the shared channel. The handoff may wait for
    /// channel capacity; because the gate is held across it, a competing
    /// submission cannot observe the pool in between.
    pub async fn submit(&self, message: DocumentMessage) -> Result<(), PoolError> {
        let gate = self.submit_gate.lock().await;
        let jobs_tx = gate.as_ref().ok_or(PoolError::Closed)?.clone();

        if self.active.load(Ordering::Acquire) < self.max_workers {
            self.spawn_worker();
        }

        let result = jobs_tx.send(message).await.map_err(|_| PoolError::Closed);
        drop(gate);
        result
    }

    fn spawn_worker(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        let worker = Worker {
            id: self.worker_seq.fetch_add(1, Ordering::Relaxed),
            jobs: Arc::clone(&self.jobs_rx),
            handler: Arc::clone(&self.handler),
            lifetime: self.worker_lifetime,
            active: Arc::clone(&self.active),
        };

        let handle = tokio::spawn(worker.run());
        self.handles.lock().expect("lock poisoned").push(handle);
        debug!(
            active = self.active.load(Ordering::Acquire),
            max = self.max_workers,
            "Spawned delivery worker"
        );
    }

    /// Number of currently active workers.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Closes the job channel and waits for every spawned worker to exit.
    ///
    /// In-flight and already-queued jobs are delivered before workers
    /// observe the closed channel.
    pub async fn drain_and_wait(&self) {
        {
            let mut gate = self.submit_gate.lock().await;
            gate.take();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().expect("lock poisoned");
            handles.drain(..).collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Delivery worker panicked during drain");
            }
        }
        debug!("Delivery pool drained");
    }
}

/// A single delivery worker.
struct Worker {
    id: u64,
    jobs: Arc<Mutex<mpsc::Receiver<DocumentMessage>>>,
    handler: Arc<dyn DeliveryHandler>,
    lifetime: Duration,
    active: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = self.id, "Delivery worker started");
        let deadline = tokio::time::Instant::now() + self.lifetime;

        loop {
            // Receive while holding the receiver lock; with queued jobs the
            // recv arm wins even past the deadline, so a worker only dies
            // of old age while the queue is idle.
            let job = {
                let mut jobs = self.jobs.lock().await;
                tokio::select! {
                    biased;
                    job = jobs.recv() => job,
                    _ = tokio::time::sleep_until(deadline) => None,
                }
            };

            let Some(message) = job else { break };

            if let Err(e) = self.handler.deliver(message.clone()).await {
                warn!(
                    worker_id = self.id,
                    session_id = %message.session_id,
                    error = %e,
                    "Delivery failed"
                );
            }
        }

        self.active.fetch_sub(1, Ordering::AcqRel);
        debug!(worker_id = self.id, "Delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::notify::NotifyError;

    /// Handler that tracks the highest number of concurrent deliveries.
    struct ConcurrencyProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
        delivered: AtomicUsize,
        hold: Duration,
    }

    impl ConcurrencyProbe {
        fn new(hold: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delivered: AtomicUsize::new(0),
                hold,
            }
        }
    }

    #[async_trait]
    impl DeliveryHandler for ConcurrencyProbe {
        async fn deliver(&self, _message: DocumentMessage) -> Result<(), NotifyError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(n: usize) -> DocumentMessage {
        DocumentMessage::submitted(
            format!("sess-{n}"),
            format!("doc-{n}"),
            format!("postprocessing/doc-{n}.pdf"),
            "report.pdf",
        )
    }

    #[tokio::test]
    async fn test_all_jobs_delivered() {
        let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(5)));
        let pool = DeliveryPool::new(4, Duration::from_secs(60), probe.clone());

        for n in 0..16 {
            pool.submit(message(n)).await.unwrap();
        }
        pool.drain_and_wait().await;

        assert_eq!(probe.delivered.load(Ordering::SeqCst), 16);
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_stays_within_ceiling() {
        let max_workers = 3;
        let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(20)));
        let pool = DeliveryPool::new(max_workers, Duration::from_secs(60), probe.clone());

        for n in 0..12 {
            pool.submit(message(n)).await.unwrap();
        }
        pool.drain_and_wait().await;

        assert_eq!(probe.delivered.load(Ordering::SeqCst), 12);
        assert!(probe.peak.load(Ordering::SeqCst) <= max_workers);
    }

    #[tokio::test]
    async fn test_submit_after_drain_is_rejected() {
        let probe = Arc::new(ConcurrencyProbe::new(Duration::ZERO));
        let pool = DeliveryPool::new(2, Duration::from_secs(60), probe);

        pool.drain_and_wait().await;

        let result = pool.submit(message(0)).await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_fresh_spawn_after_workers_expire() {
        let probe = Arc::new(ConcurrencyProbe::new(Duration::ZERO));
        let pool = DeliveryPool::new(2, Duration::from_millis(30), probe.clone());

        pool.submit(message(0)).await.unwrap();

        // Let the first worker age out while the queue is idle.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.active_workers(), 0);

        // A new job triggers a fresh spawn and still gets delivered.
        pool.submit(message(1)).await.unwrap();
        pool.drain_and_wait().await;

        assert_eq!(probe.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_kill_worker() {
        struct FlakyHandler {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl DeliveryHandler for FlakyHandler {
            async fn deliver(&self, message: DocumentMessage) -> Result<(), NotifyError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if message.session_id == "sess-0" {
                    Err(NotifyError::Delivery(message.session_id))
                } else {
                    Ok(())
                }
            }
        }

        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
        });
        let pool = DeliveryPool::new(1, Duration::from_secs(60), handler.clone());

        pool.submit(message(0)).await.unwrap(); // fails, logged
        pool.submit(message(1)).await.unwrap(); // same worker continues
        pool.drain_and_wait().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
