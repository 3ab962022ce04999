//! Bounded in-process work queue and the worker pool that drains it.
//!
//! Intake never blocks: when the queue is full the id is dropped and the
//! sweep picks the job up again later, since it is still `pending` in the
//! database. Ids already waiting in the queue are not enqueued twice.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use beacon_engine::JobProcessor;

use crate::stats::WorkerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    AlreadyQueued,
    Full,
    Closed,
}

/// Producer side, cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<String>,
    queued: Arc<Mutex<HashSet<String>>>,
    stats: Arc<WorkerStats>,
}

/// Consumer side, shared by all workers.
pub struct WorkReceiver {
    receiver: mpsc::Receiver<String>,
    queued: Arc<Mutex<HashSet<String>>>,
}

impl WorkQueue {
    pub fn new(capacity: usize, stats: Arc<WorkerStats>) -> (Self, WorkReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queued = Arc::new(Mutex::new(HashSet::new()));

        (
            Self {
                sender,
                queued: queued.clone(),
                stats,
            },
            WorkReceiver { receiver, queued },
        )
    }

    pub async fn enqueue(&self, job_id: &str) -> Enqueued {
        let mut queued = self.queued.lock().await;
        if queued.contains(job_id) {
            return Enqueued::AlreadyQueued;
        }

        match self.sender.try_send(job_id.to_string()) {
            Ok(()) => {
                queued.insert(job_id.to_string());
                self.stats.record_enqueued();
                Enqueued::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_dropped();
                tracing::warn!(job_id, "Work queue full, leaving job for the next sweep");
                Enqueued::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueued::Closed,
        }
    }

    /// Number of ids waiting for a worker.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

impl WorkReceiver {
    pub async fn next(&mut self) -> Option<String> {
        let job_id = self.receiver.recv().await?;
        self.queued.lock().await.remove(&job_id);
        Some(job_id)
    }
}

/// Spawn `concurrency` workers that process ids until the queue closes or
/// `shutdown` is cancelled.
///
/// Cancellation stops workers from taking new ids; a job already being
/// processed runs to completion. Ids left in the queue are still `pending`
/// in the database.
pub fn spawn_workers(
    concurrency: usize,
    receiver: WorkReceiver,
    processor: Arc<JobProcessor>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
) -> JoinSet<()> {
    let receiver = Arc::new(Mutex::new(receiver));
    let mut workers = JoinSet::new();

    for worker_id in 0..concurrency.max(1) {
        let receiver = receiver.clone();
        let processor = processor.clone();
        let stats = stats.clone();
        let shutdown = shutdown.clone();

        workers.spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::debug!(worker_id, "Shutdown requested, worker exiting");
                        break;
                    }
                    next = async { receiver.lock().await.next().await } => next,
                };

                let Some(job_id) = next else {
                    tracing::debug!(worker_id, "Work queue closed, worker exiting");
                    break;
                };

                match processor.process(&job_id).await {
                    Ok(outcome) => stats.record_outcome(&outcome),
                    Err(e) => {
                        stats.record_outcome_error();
                        tracing::error!(
                            worker_id,
                            job_id = %job_id,
                            error = %format!("{:#}", e),
                            "Job processing failed, leaving it for recovery"
                        );
                    }
                }
            }
        });
    }

    workers
}
