//! Process-wide counters exposed on the health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use beacon_common::types::JobStatus;
use beacon_engine::ProcessOutcome;

#[derive(Debug, Default)]
pub struct WorkerStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    no_tokens: AtomicU64,
    skipped: AtomicU64,
    superseded: AtomicU64,
    errors: AtomicU64,
    recovered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
    pub no_tokens: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub errors: u64,
    pub recovered: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self, count: usize) {
        self.recovered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &ProcessOutcome) {
        let counter = match outcome {
            ProcessOutcome::Skipped => &self.skipped,
            ProcessOutcome::Superseded => &self.superseded,
            ProcessOutcome::Finalized(o) => match o.status {
                JobStatus::Sent => &self.sent,
                JobStatus::NoTokens => &self.no_tokens,
                _ => &self.failed,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            no_tokens: self.no_tokens.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}
