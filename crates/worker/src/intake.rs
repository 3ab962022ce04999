//! Job intake: live notifications plus the periodic recovery sweep.
//!
//! Both paths only ever enqueue ids. Whether a job actually runs is decided
//! by the claim, so duplicate or stale ids are harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::time::MissedTickBehavior;

use beacon_common::config::AppConfig;
use beacon_common::error::AppError;
use beacon_engine::JobStore;

use crate::queue::{Enqueued, WorkQueue};
use crate::stats::WorkerStats;

/// Channel the `dispatch_jobs` insert trigger notifies on.
pub const PENDING_CHANNEL: &str = "dispatch_job_pending";

/// Delay before re-listening after the notification connection fails.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

async fn enqueue_all(queue: &WorkQueue, ids: &[String]) -> usize {
    let mut queued = 0;
    for id in ids {
        if queue.enqueue(id).await == Enqueued::Queued {
            queued += 1;
        }
    }
    queued
}

/// Live intake over PostgreSQL LISTEN/NOTIFY.
pub struct Intake {
    jobs: Arc<dyn JobStore>,
    queue: WorkQueue,
    page_size: i64,
}

impl Intake {
    pub fn new(jobs: Arc<dyn JobStore>, queue: WorkQueue, page_size: i64) -> Self {
        Self {
            jobs,
            queue,
            page_size,
        }
    }

    /// Enqueue the oldest page of pending jobs.
    pub async fn drain_pending(&self) -> Result<usize, AppError> {
        let ids = self.jobs.list_pending(self.page_size).await?;
        Ok(enqueue_all(&self.queue, &ids).await)
    }

    /// Handle one notification: queue the announced job, then a page of
    /// the oldest pending jobs.
    pub async fn on_notification(&self, job_id: &str) -> Result<usize, AppError> {
        let job_id = job_id.trim();
        let announced = !job_id.is_empty() && self.queue.enqueue(job_id).await == Enqueued::Queued;
        Ok(self.drain_pending().await? + usize::from(announced))
    }

    /// Listen for new pending jobs until the task is cancelled.
    ///
    /// Every (re)connect drains a page of pending jobs first, covering
    /// notifications sent while nobody was listening.
    pub async fn run(&self, pool: &PgPool) -> anyhow::Result<()> {
        loop {
            let mut listener = match PgListener::connect_with(pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to open notification connection");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            if let Err(e) = listener.listen(PENDING_CHANNEL).await {
                tracing::error!(error = %e, channel = PENDING_CHANNEL, "LISTEN failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
            tracing::info!(channel = PENDING_CHANNEL, "Listening for pending jobs");

            match self.drain_pending().await {
                Ok(queued) if queued > 0 => tracing::info!(queued, "Queued pending jobs"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Pending job catch-up failed"),
            }

            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let job_id = notification.payload();
                        match self.on_notification(job_id).await {
                            Ok(queued) => tracing::debug!(job_id, queued, "Pending job notified"),
                            Err(e) => tracing::warn!(job_id, error = %e, "Pending job intake failed"),
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("Notification connection lost, catching up");
                        match self.drain_pending().await {
                            Ok(queued) => tracing::info!(queued, "Queued pending jobs"),
                            Err(e) => tracing::warn!(error = %e, "Pending job catch-up failed"),
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Notification stream failed, reconnecting");
                        break;
                    }
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub recovered: usize,
    pub queued: usize,
}

/// Periodic sweep: reset abandoned claims, then re-enqueue pending jobs.
pub struct Sweeper {
    jobs: Arc<dyn JobStore>,
    queue: WorkQueue,
    stats: Arc<WorkerStats>,
    interval: Duration,
    page_size: i64,
    processing_timeout: Duration,
}

impl Sweeper {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: WorkQueue,
        stats: Arc<WorkerStats>,
        config: &AppConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            stats,
            interval: Duration::from_millis(config.sweep_interval_ms),
            page_size: config.sweep_page_size,
            processing_timeout: Duration::from_millis(config.processing_timeout_ms),
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, AppError> {
        let cutoff = Utc::now().timestamp_millis() - self.processing_timeout.as_millis() as i64;

        let recovered = self.jobs.recover_stuck(cutoff, self.page_size).await?;
        if !recovered.is_empty() {
            self.stats.record_recovered(recovered.len());
            tracing::warn!(
                count = recovered.len(),
                jobs = ?recovered,
                "Recovered jobs stuck in processing"
            );
        }

        let pending = self.jobs.list_pending(self.page_size).await?;
        let queued = enqueue_all(&self.queue, &pending).await;

        Ok(SweepReport {
            recovered: recovered.len(),
            queued,
        })
    }

    /// Sweep on a fixed interval until the task is cancelled.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.processing_timeout.as_millis() as u64,
            "Recovery sweep started"
        );

        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) if report.recovered > 0 || report.queued > 0 => {
                    tracing::info!(
                        recovered = report.recovered,
                        queued = report.queued,
                        "Sweep complete"
                    );
                }
                Ok(_) => tracing::trace!("Sweep found nothing to do"),
                Err(e) => tracing::error!(error = %e, "Sweep failed"),
            }
        }
    }
}
