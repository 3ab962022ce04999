//! Shared state for the operational HTTP endpoints.

use std::sync::Arc;

use beacon_engine::JobStore;

use crate::queue::WorkQueue;
use crate::stats::WorkerStats;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub queue: WorkQueue,
    pub stats: Arc<WorkerStats>,
    pub gateway: &'static str,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: WorkQueue,
        stats: Arc<WorkerStats>,
        gateway: &'static str,
    ) -> Self {
        Self {
            jobs,
            queue,
            stats,
            gateway,
        }
    }
}
