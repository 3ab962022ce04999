//! In-process job queue and device token store.
//!
//! Every operation runs under one mutex guard, which gives the conditional
//! updates the same atomicity the PostgreSQL transactions provide.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use beacon_common::error::AppError;
use beacon_common::types::{DeviceToken, DispatchJob, JobOutcome, JobStatus, TokenClaim};

use super::{DeviceStore, JobStore};

#[derive(Debug, Default)]
struct UserRecord {
    /// `None` models a user record without the inline field at all
    inline: Option<Vec<String>>,
    sub_records: Vec<DeviceToken>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, DispatchJob>,
    users: HashMap<String, UserRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a job as a producer would.
    pub async fn insert_job(&self, job: DispatchJob) {
        self.state.lock().await.jobs.insert(job.id.clone(), job);
    }

    /// Replace a user's inline token list.
    pub async fn set_inline_tokens(&self, user_id: &str, tokens: &[&str]) {
        let mut state = self.state.lock().await;
        let user = state.users.entry(user_id.to_string()).or_default();
        user.inline = Some(tokens.iter().map(|t| t.to_string()).collect());
    }

    /// Add a per-token sub-record for a user.
    pub async fn add_sub_record(&self, user_id: &str, token: DeviceToken) {
        let mut state = self.state.lock().await;
        state
            .users
            .entry(user_id.to_string())
            .or_default()
            .sub_records
            .push(token);
    }

    /// Every token a user holds, inline entries first.
    pub async fn user_tokens(&self, user_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .users
            .get(user_id)
            .map(|user| {
                user.inline
                    .iter()
                    .flatten()
                    .cloned()
                    .chain(user.sub_records.iter().map(|d| d.token.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Force a job into `processing` as if claimed at `started_at` by a lost worker.
    pub async fn mark_processing(&self, job_id: &str, started_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = JobStatus::Processing;
            job.processing_started_at = Some(started_at);
            job.attempt += 1;
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn claim(&self, job_id: &str) -> Result<Option<DispatchJob>, AppError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(None);
        };

        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        let now = Utc::now();
        job.status = JobStatus::Processing;
        job.processing_started_at = Some(now);
        job.updated_at = Some(now);
        job.attempt += 1;

        Ok(Some(job.clone()))
    }

    async fn holds_claim(&self, job_id: &str, attempt: i32) -> Result<bool, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(job_id)
            .is_some_and(|job| job.status == JobStatus::Processing && job.attempt == attempt))
    }

    async fn finalize(
        &self,
        job_id: &str,
        attempt: i32,
        outcome: &JobOutcome,
    ) -> Result<bool, AppError> {
        if !JobStatus::Processing.can_transition_to(outcome.status) {
            return Err(AppError::InvalidTransition(format!(
                "processing -> {} is not a terminal transition",
                outcome.status
            )));
        }

        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Processing || job.attempt != attempt {
            return Ok(false);
        }

        let now = Utc::now();
        job.status = outcome.status;
        if outcome.status == JobStatus::Sent {
            job.sent_at = Some(now);
        }
        job.updated_at = Some(now);
        job.success_count = outcome.success_count;
        job.failed_count = outcome.failed_count;
        job.token_count = outcome.token_count;
        job.last_errors = outcome.errors.clone();
        job.error = outcome.error.clone();
        job.dry_run = outcome.dry_run;

        Ok(true)
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<String>, AppError> {
        let state = self.state.lock().await;
        let mut pending: Vec<&DispatchJob> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.created_at_millis
                .cmp(&b.created_at_millis)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| job.id.clone())
            .collect())
    }

    async fn recover_stuck(&self, cutoff_millis: i64, limit: i64) -> Result<Vec<String>, AppError> {
        let mut state = self.state.lock().await;

        let mut stuck: Vec<(i64, String)> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.created_at_millis < cutoff_millis
                    && job
                        .processing_started_at
                        .is_none_or(|at| at.timestamp_millis() < cutoff_millis)
            })
            .map(|job| (job.created_at_millis, job.id.clone()))
            .collect();
        stuck.sort();
        stuck.truncate(limit.max(0) as usize);

        let now = Utc::now();
        let mut recovered = Vec::with_capacity(stuck.len());
        for (_, id) in stuck {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Pending;
                job.processing_started_at = None;
                job.updated_at = Some(now);
                recovered.push(id);
            }
        }

        Ok(recovered)
    }

    async fn get(&self, job_id: &str) -> Result<Option<DispatchJob>, AppError> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn inline_tokens(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, AppError> {
        let state = self.state.lock().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| {
                let inline = state.users.get(id)?.inline.clone()?;
                Some((id.clone(), inline))
            })
            .collect())
    }

    async fn sub_record_tokens(&self, user_id: &str) -> Result<Vec<DeviceToken>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .get(user_id)
            .map(|user| user.sub_records.clone())
            .unwrap_or_default())
    }

    async fn inline_claims(&self, token: &str) -> Result<Vec<TokenClaim>, AppError> {
        let state = self.state.lock().await;
        let mut claims: Vec<TokenClaim> = state
            .users
            .iter()
            .filter(|(_, user)| user.inline.iter().flatten().any(|t| t == token))
            .map(|(id, _)| TokenClaim {
                user_id: id.clone(),
                last_seen_at: None,
            })
            .collect();
        claims.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(claims)
    }

    async fn sub_record_claims(&self, token: &str) -> Result<Vec<TokenClaim>, AppError> {
        let state = self.state.lock().await;
        let mut claims: Vec<TokenClaim> = state
            .users
            .iter()
            .flat_map(|(id, user)| {
                user.sub_records
                    .iter()
                    .filter(|d| d.token == token)
                    .map(|d| TokenClaim {
                        user_id: id.clone(),
                        last_seen_at: d.last_seen_at,
                    })
            })
            .collect();
        claims.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(claims)
    }

    async fn remove_user_token(&self, user_id: &str, token: &str) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        Ok(state
            .users
            .get_mut(user_id)
            .map(|user| strip_token(user, token))
            .unwrap_or(0))
    }

    async fn remove_token(&self, token: &str) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        Ok(state
            .users
            .values_mut()
            .map(|user| strip_token(user, token))
            .sum())
    }
}

fn strip_token(user: &mut UserRecord, token: &str) -> u64 {
    let mut removed = 0;

    if let Some(inline) = user.inline.as_mut() {
        let before = inline.len();
        inline.retain(|t| t != token);
        if inline.len() != before {
            removed += 1;
        }
    }

    let before = user.sub_records.len();
    user.sub_records.retain(|d| d.token != token);
    removed += (before - user.sub_records.len()) as u64;

    removed
}
