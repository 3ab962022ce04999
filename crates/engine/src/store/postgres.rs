//! PostgreSQL-backed job queue and device token store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use beacon_common::error::AppError;
use beacon_common::types::{DeviceToken, DispatchJob, JobOutcome, JobStatus, TokenClaim};

use super::{DeviceStore, JobStore};

/// Both stores over one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn claim(&self, job_id: &str) -> Result<Option<DispatchJob>, AppError> {
        let mut tx = self.pool.begin().await?;

        // Row lock: a concurrent claimer blocks here and then sees our write.
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM dispatch_jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = match current {
            Some((status,)) => status.parse::<JobStatus>().map_err(AppError::Internal)?,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        if status != JobStatus::Pending {
            tx.rollback().await?;
            tracing::debug!(job_id, status = %status, "Claim skipped, job not pending");
            return Ok(None);
        }

        let job: DispatchJob = sqlx::query_as(
            r#"
            UPDATE dispatch_jobs
            SET status = 'processing',
                processing_started_at = NOW(),
                updated_at = NOW(),
                attempt = attempt + 1
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn holds_claim(&self, job_id: &str, attempt: i32) -> Result<bool, AppError> {
        let (held,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM dispatch_jobs
                WHERE id = $1 AND attempt = $2 AND status = 'processing'
            )
            "#,
        )
        .bind(job_id)
        .bind(attempt)
        .fetch_one(&self.pool)
        .await?;

        Ok(held)
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

        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = $3,
                sent_at = CASE WHEN $3 = 'sent' THEN NOW() ELSE sent_at END,
                updated_at = NOW(),
                success_count = $4,
                failed_count = $5,
                token_count = $6,
                last_errors = $7,
                error = $8,
                dry_run = $9
            WHERE id = $1 AND attempt = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(attempt)
        .bind(outcome.status.as_str())
        .bind(outcome.success_count)
        .bind(outcome.failed_count)
        .bind(outcome.token_count)
        .bind(Json(&outcome.errors))
        .bind(&outcome.error)
        .bind(outcome.dry_run)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM dispatch_jobs
            WHERE status = 'pending'
            ORDER BY created_at_millis ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn recover_stuck(&self, cutoff_millis: i64, limit: i64) -> Result<Vec<String>, AppError> {
        let cutoff_at = Utc
            .timestamp_millis_opt(cutoff_millis)
            .single()
            .ok_or_else(|| AppError::Internal(format!("invalid cutoff {}", cutoff_millis)))?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE dispatch_jobs
            SET status = 'pending',
                processing_started_at = NULL,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM dispatch_jobs
                WHERE status = 'processing'
                  AND created_at_millis < $1
                  AND (processing_started_at IS NULL OR processing_started_at < $2)
                ORDER BY created_at_millis ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'processing'
            RETURNING id
            "#,
        )
        .bind(cutoff_millis)
        .bind(cutoff_at)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get(&self, job_id: &str) -> Result<Option<DispatchJob>, AppError> {
        let job = sqlx::query_as("SELECT * FROM dispatch_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn inline_tokens(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, AppError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(String, Vec<String>)> =
            sqlx::query_as("SELECT id, fcm_tokens FROM users WHERE id = ANY($1)")
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().collect())
    }

    async fn sub_record_tokens(&self, user_id: &str) -> Result<Vec<DeviceToken>, AppError> {
        let tokens = sqlx::query_as(
            r#"
            SELECT token, platform, last_seen_at
            FROM user_fcm_tokens
            WHERE user_id = $1
            ORDER BY last_seen_at DESC NULLS LAST, token
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tokens)
    }

    async fn inline_claims(&self, token: &str) -> Result<Vec<TokenClaim>, AppError> {
        let claims = sqlx::query_as(
            r#"
            SELECT id AS user_id, NULL::timestamptz AS last_seen_at
            FROM users
            WHERE $1 = ANY(fcm_tokens)
            "#,
        )
        .bind(token)
        .fetch_all(&self.pool)
        .await?;

        Ok(claims)
    }

    async fn sub_record_claims(&self, token: &str) -> Result<Vec<TokenClaim>, AppError> {
        let claims =
            sqlx::query_as("SELECT user_id, last_seen_at FROM user_fcm_tokens WHERE token = $1")
                .bind(token)
                .fetch_all(&self.pool)
                .await?;

        Ok(claims)
    }

    async fn remove_user_token(&self, user_id: &str, token: &str) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let inline = sqlx::query(
            r#"
            UPDATE users
            SET fcm_tokens = array_remove(fcm_tokens, $2), updated_at = NOW()
            WHERE id = $1 AND $2 = ANY(fcm_tokens)
            "#,
        )
        .bind(user_id)
        .bind(token)
        .execute(&mut *tx)
        .await?;

        let sub_records =
            sqlx::query("DELETE FROM user_fcm_tokens WHERE user_id = $1 AND token = $2")
                .bind(user_id)
                .bind(token)
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(inline.rows_affected() + sub_records.rows_affected())
    }

    async fn remove_token(&self, token: &str) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let inline = sqlx::query(
            r#"
            UPDATE users
            SET fcm_tokens = array_remove(fcm_tokens, $1), updated_at = NOW()
            WHERE $1 = ANY(fcm_tokens)
            "#,
        )
        .bind(token)
        .execute(&mut *tx)
        .await?;

        let sub_records = sqlx::query("DELETE FROM user_fcm_tokens WHERE token = $1")
            .bind(token)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(inline.rows_affected() + sub_records.rows_affected())
    }
}
