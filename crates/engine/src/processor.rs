//! Job processing pipeline.
//!
//! Receives job ids from the work queue and:
//! 1. Claims the job (`pending -> processing`, bumping its attempt)
//! 2. Resolves recipient tokens (via `TokenResolver`)
//! 3. Sends the message in batches (via `Deliverer`)
//! 4. Writes the terminal status under the same attempt
//! 5. Prunes tokens the provider reported as invalid (via `TokenPruner`)

use std::sync::Arc;

use anyhow::Context;

use beacon_common::config::AppConfig;
use beacon_common::types::{DispatchJob, JobOutcome};
use beacon_notifier::{PushGateway, PushMessage};

use crate::delivery::Deliverer;
use crate::ownership::{OwnerCache, OwnershipResolver};
use crate::pruning::TokenPruner;
use crate::resolver::{ResolverOptions, TokenResolver};
use crate::store::{DeviceStore, JobStore};

#[derive(Debug, Clone, Copy)]
pub struct ProcessorOptions {
    pub exclude_sender: bool,
    pub enforce_ownership: bool,
    pub ownership_cleanup: bool,
    pub owner_cache_capacity: usize,
}

impl ProcessorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            exclude_sender: config.exclude_sender,
            enforce_ownership: config.enforce_ownership,
            ownership_cleanup: config.ownership_cleanup,
            owner_cache_capacity: config.owner_cache_capacity,
        }
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            exclude_sender: true,
            enforce_ownership: true,
            ownership_cleanup: false,
            owner_cache_capacity: 10_000,
        }
    }
}

/// What happened to one job id taken off the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Missing or not `pending`; another worker has it or it is done
    Skipped,
    /// The claim was lost to the recovery sweep before it could be finalized
    Superseded,
    Finalized(JobOutcome),
}

pub struct JobProcessor {
    jobs: Arc<dyn JobStore>,
    resolver: TokenResolver,
    deliverer: Deliverer,
    pruner: TokenPruner,
}

impl JobProcessor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        devices: Arc<dyn DeviceStore>,
        gateway: Arc<dyn PushGateway>,
        options: ProcessorOptions,
    ) -> Self {
        let cache = Arc::new(OwnerCache::new(options.owner_cache_capacity));
        let ownership = Arc::new(OwnershipResolver::new(
            devices.clone(),
            cache.clone(),
            options.ownership_cleanup,
        ));
        let resolver = TokenResolver::new(
            devices.clone(),
            ownership,
            ResolverOptions {
                exclude_sender: options.exclude_sender,
                enforce_ownership: options.enforce_ownership,
            },
        );

        Self {
            jobs,
            resolver,
            deliverer: Deliverer::new(gateway),
            pruner: TokenPruner::new(devices, cache),
        }
    }

    /// Run one job through the full pipeline.
    ///
    /// An error leaves the job in `processing`; the recovery sweep hands it
    /// back to `pending` once the processing timeout has passed.
    pub async fn process(&self, job_id: &str) -> anyhow::Result<ProcessOutcome> {
        let Some(job) = self.jobs.claim(job_id).await? else {
            tracing::debug!(job_id, "Job not claimable, skipping");
            return Ok(ProcessOutcome::Skipped);
        };

        tracing::info!(
            job_id = %job.id,
            attempt = job.attempt,
            targets = job.target_user_ids.len(),
            "Claimed job"
        );

        let resolution = self
            .resolver
            .resolve(&job)
            .await
            .with_context(|| format!("resolving tokens for job {}", job.id))?;

        if resolution.tokens.is_empty() {
            let reason = if resolution.dropped.is_empty() && resolution.excluded_sender == 0 {
                "No device tokens found for recipients"
            } else {
                "All device tokens were filtered out"
            };
            return self.finalize(&job, JobOutcome::no_tokens(reason)).await;
        }

        // Last check before anything leaves the process.
        if !self.jobs.holds_claim(&job.id, job.attempt).await? {
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempt,
                "Claim lost before send, abandoning attempt"
            );
            return Ok(ProcessOutcome::Superseded);
        }

        let message = PushMessage::from_job(&job);
        let report = self.deliverer.deliver(&message, &resolution.tokens).await;

        tracing::info!(
            job_id = %job.id,
            gateway = self.deliverer.gateway_name(),
            tokens = resolution.tokens.len(),
            success = report.success_count,
            failed = report.failed_count,
            "Delivery complete"
        );

        let outcome =
            JobOutcome::from_delivery(report.success_count, report.failed_count, &report.failures)
                .simulated(self.deliverer.is_simulated());
        let finalized = self.finalize(&job, outcome).await;

        if !report.invalid_tokens.is_empty() {
            self.pruner.prune(&report.invalid_tokens).await;
        }

        finalized
    }

    async fn finalize(
        &self,
        job: &DispatchJob,
        outcome: JobOutcome,
    ) -> anyhow::Result<ProcessOutcome> {
        let applied = self
            .jobs
            .finalize(&job.id, job.attempt, &outcome)
            .await
            .with_context(|| format!("finalizing job {}", job.id))?;

        if !applied {
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempt,
                status = %outcome.status,
                "Job was reclaimed, result discarded"
            );
            return Ok(ProcessOutcome::Superseded);
        }

        tracing::info!(
            job_id = %job.id,
            status = %outcome.status,
            success = outcome.success_count,
            failed = outcome.failed_count,
            "Job finalized"
        );
        Ok(ProcessOutcome::Finalized(outcome))
    }
}
