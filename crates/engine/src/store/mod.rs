//! Storage seams for the job queue and the device token store.
//!
//! `PgStore` is the production backend; `MemoryStore` keeps the same
//! semantics in-process for tests and local runs.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;

use beacon_common::error::AppError;
use beacon_common::types::{DeviceToken, DispatchJob, JobOutcome, TokenClaim};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// The dispatch job queue.
///
/// Every mutation is conditional on the job's current status so concurrent
/// workers (and the sweep) can never take an illegal transition.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically move `pending -> processing` and bump the attempt counter.
    ///
    /// Returns `None` when the job is missing or no longer `pending`.
    async fn claim(&self, job_id: &str) -> Result<Option<DispatchJob>, AppError>;

    /// Whether `attempt` still holds the claim on the job.
    async fn holds_claim(&self, job_id: &str, attempt: i32) -> Result<bool, AppError>;

    /// Write a terminal status for the given attempt.
    ///
    /// Returns `false` (and changes nothing) if the job is not `processing`
    /// under that attempt anymore.
    async fn finalize(
        &self,
        job_id: &str,
        attempt: i32,
        outcome: &JobOutcome,
    ) -> Result<bool, AppError>;

    /// Ids of `pending` jobs, oldest `created_at_millis` first.
    async fn list_pending(&self, limit: i64) -> Result<Vec<String>, AppError>;

    /// Reset `processing` jobs created and claimed before `cutoff_millis` back to `pending`.
    async fn recover_stuck(&self, cutoff_millis: i64, limit: i64) -> Result<Vec<String>, AppError>;

    async fn get(&self, job_id: &str) -> Result<Option<DispatchJob>, AppError>;
}

/// Per-user delivery tokens in both accepted shapes.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Inline token lists for many users in one round trip.
    ///
    /// Users without a record are absent from the map.
    async fn inline_tokens(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, AppError>;

    /// Per-token sub-records of one user.
    async fn sub_record_tokens(&self, user_id: &str) -> Result<Vec<DeviceToken>, AppError>;

    /// Users whose inline list contains `token`.
    async fn inline_claims(&self, token: &str) -> Result<Vec<TokenClaim>, AppError>;

    /// Users holding a sub-record for `token`.
    async fn sub_record_claims(&self, token: &str) -> Result<Vec<TokenClaim>, AppError>;

    /// Remove `token` from one user's records (both shapes). Returns entries removed.
    async fn remove_user_token(&self, user_id: &str, token: &str) -> Result<u64, AppError>;

    /// Remove `token` from every user's records (both shapes). Returns entries removed.
    async fn remove_token(&self, token: &str) -> Result<u64, AppError>;
}
