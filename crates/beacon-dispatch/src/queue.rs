use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::DispatchError;

/// Jobs buffered per worker when sizing from available parallelism.
const BUFFER_PER_WORKER: usize = 5;

/// Performs one delivery attempt. Implementations never retry.
#[async_trait]
pub trait Deliver<T>: Send + Sync + 'static {
    async fn deliver(&self, target: &str, payload: T) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// A unit of outbound work. Claimed by exactly one worker and attempted once.
pub struct DeliveryJob<T> {
    pub target: String,
    pub payload: T,
    pub completion: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl<T> DeliveryJob<T> {
    pub fn new(target: impl Into<String>, payload: T) -> Self {
        Self {
            target: target.into(),
            payload,
            completion: None,
        }
    }

    /// Job plus a receiver that resolves once the attempt finished.
    pub fn with_completion(
        target: impl Into<String>,
        payload: T,
    ) -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            target: target.into(),
            payload,
            completion: Some(tx),
        };
        (job, rx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizing {
    pub workers: usize,
    pub capacity: usize,
}

impl QueueSizing {
    pub fn new(workers: usize, capacity: usize) -> Self {
        Self {
            workers: workers.max(1),
            capacity: capacity.max(1),
        }
    }

    /// One worker per available CPU, five buffered jobs per worker.
    pub fn from_parallelism() -> Self {
        let workers = parallelism();
        Self::new(workers, workers * BUFFER_PER_WORKER)
    }

    /// Buffer sized for an expected burst, e.g. the number of known
    /// webhook destinations.
    pub fn for_fanout(expected: usize, floor: usize, multiplier: usize) -> Self {
        Self::new(parallelism(), expected.max(floor) * multiplier)
    }
}

fn parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Bounded multi-producer queue drained by a fixed pool of worker tasks.
///
/// Producers that find the buffer full wait for space instead of dropping
/// the job. Each job gets a single delivery attempt; failures are logged and
/// discarded.
pub struct DispatchQueue<T> {
    name: Arc<str>,
    tx: mpsc::Sender<DeliveryJob<T>>,
}

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> DispatchQueue<T> {
    /// Create the channel and spawn the workers. Must be called inside a
    /// tokio runtime.
    pub fn start(name: &str, sizing: QueueSizing, deliverer: Arc<dyn Deliver<T>>) -> Self {
        let (tx, rx) = mpsc::channel(sizing.capacity);
        let rx = Arc::new(Mutex::new(rx));
        let name: Arc<str> = Arc::from(name);

        for worker_id in 1..=sizing.workers {
            tokio::spawn(worker(
                worker_id,
                name.clone(),
                rx.clone(),
                deliverer.clone(),
            ));
        }

        debug!(
            "Started {} queue with {} workers, buffer {}",
            name, sizing.workers, sizing.capacity
        );

        Self { name, tx }
    }

    pub async fn enqueue(&self, job: DeliveryJob<T>) -> Result<(), DispatchError> {
        let target = job.target.clone();

        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!("{} job queue is full", self.name);
                // Blocks until a worker frees a slot
                self.tx
                    .send(job)
                    .await
                    .map_err(|_| DispatchError::QueueClosed)?;
            }
            Err(TrySendError::Closed(_)) => return Err(DispatchError::QueueClosed),
        }

        trace!("Queued request for {} destination {}", self.name, target);
        Ok(())
    }

    /// Free slots left in the buffer.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

async fn worker<T: Send + 'static>(
    worker_id: usize,
    name: Arc<str>,
    rx: Arc<Mutex<mpsc::Receiver<DeliveryJob<T>>>>,
    deliverer: Arc<dyn Deliver<T>>,
) {
    debug!("Started {} worker {}", name, worker_id);

    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        let outcome = match deliverer.deliver(&job.target, job.payload).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => {
                error!("{} destination {} failed to send: {}", name, job.target, e);
                DeliveryOutcome::Failed(e.to_string())
            }
        };

        trace!(
            "Done with {} destination {} using worker {}",
            name, job.target, worker_id
        );

        if let Some(done) = job.completion {
            let _ = done.send(outcome);
        }
    }

    debug!("{} worker {} stopped", name, worker_id);
}
