//! Turns a job into the list of device tokens to send to.
//!
//! Users' tokens live in one of two shapes (an inline list on the user
//! record, or per-token sub-records). Sources are tried in order and later
//! sources only see the users earlier ones found nothing usable for.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use beacon_common::error::AppError;
use beacon_common::types::DispatchJob;

use crate::ownership::{DroppedToken, OwnershipResolver};
use crate::store::DeviceStore;

/// Tokens this short are treated as malformed and never sent.
pub const MALFORMED_TOKEN_MAX_LEN: usize = 10;

pub fn is_well_formed(token: &str) -> bool {
    token.len() > MALFORMED_TOKEN_MAX_LEN
}

/// One storage shape of per-user tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tokens per user. Users with nothing in this shape may be omitted.
    async fn lookup(&self, user_ids: &[String]) -> Result<HashMap<String, Vec<String>>, AppError>;
}

/// Inline token lists, fetched for all users in one call.
pub struct InlineTokenSource {
    devices: Arc<dyn DeviceStore>,
}

impl InlineTokenSource {
    pub fn new(devices: Arc<dyn DeviceStore>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl TokenSource for InlineTokenSource {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn lookup(&self, user_ids: &[String]) -> Result<HashMap<String, Vec<String>>, AppError> {
        self.devices.inline_tokens(user_ids).await
    }
}

/// Per-token sub-records, fetched user by user.
pub struct SubRecordTokenSource {
    devices: Arc<dyn DeviceStore>,
}

impl SubRecordTokenSource {
    pub fn new(devices: Arc<dyn DeviceStore>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl TokenSource for SubRecordTokenSource {
    fn name(&self) -> &'static str {
        "sub-record"
    }

    async fn lookup(&self, user_ids: &[String]) -> Result<HashMap<String, Vec<String>>, AppError> {
        let mut found = HashMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            let records = self.devices.sub_record_tokens(user_id).await?;
            if !records.is_empty() {
                found.insert(
                    user_id.clone(),
                    records.into_iter().map(|r| r.token).collect(),
                );
            }
        }
        Ok(found)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverOptions {
    pub exclude_sender: bool,
    pub enforce_ownership: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            exclude_sender: true,
            enforce_ownership: true,
        }
    }
}

/// Final recipient tokens for a job plus what was filtered out on the way.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Unique, well-formed tokens in first-seen order
    pub tokens: Vec<String>,
    pub excluded_sender: usize,
    pub dropped: Vec<DroppedToken>,
    pub malformed: usize,
}

pub struct TokenResolver {
    sources: Vec<Box<dyn TokenSource>>,
    ownership: Arc<OwnershipResolver>,
    options: ResolverOptions,
}

impl TokenResolver {
    /// Inline lists first, sub-records as the fallback.
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        ownership: Arc<OwnershipResolver>,
        options: ResolverOptions,
    ) -> Self {
        let sources: Vec<Box<dyn TokenSource>> = vec![
            Box::new(InlineTokenSource::new(devices.clone())),
            Box::new(SubRecordTokenSource::new(devices)),
        ];
        Self::with_sources(sources, ownership, options)
    }

    pub fn with_sources(
        sources: Vec<Box<dyn TokenSource>>,
        ownership: Arc<OwnershipResolver>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            sources,
            ownership,
            options,
        }
    }

    pub async fn resolve(&self, job: &DispatchJob) -> Result<Resolution, AppError> {
        let mut resolution = Resolution::default();

        let candidates = match job.explicit_tokens() {
            Some(explicit) => explicit.to_vec(),
            None => self.tokens_for_users(&job.target_user_ids).await?,
        };

        let mut candidates: Vec<String> = dedupe(candidates)
            .into_iter()
            .filter(|token| {
                let ok = is_well_formed(token);
                if !ok {
                    resolution.malformed += 1;
                }
                ok
            })
            .collect();

        if self.options.exclude_sender
            && let Some(sender) = job.sender_user_id.as_deref().filter(|s| !s.is_empty())
        {
            let own: HashSet<String> = self
                .tokens_for_users(&[sender.to_string()])
                .await?
                .into_iter()
                .collect();
            let before = candidates.len();
            candidates.retain(|token| !own.contains(token));
            resolution.excluded_sender = before - candidates.len();
        }

        if self.options.enforce_ownership && !candidates.is_empty() {
            let report = self
                .ownership
                .filter(candidates, &job.target_user_ids)
                .await?;
            candidates = report.allowed;
            resolution.dropped = report.dropped;
        }

        resolution.tokens = candidates;

        tracing::debug!(
            job_id = %job.id,
            tokens = resolution.tokens.len(),
            excluded_sender = resolution.excluded_sender,
            dropped = resolution.dropped.len(),
            malformed = resolution.malformed,
            "Resolved tokens"
        );

        Ok(resolution)
    }

    /// Tokens of the given users across all sources, in user order.
    async fn tokens_for_users(&self, user_ids: &[String]) -> Result<Vec<String>, AppError> {
        let users: Vec<String> = dedupe(user_ids.iter().filter(|u| !u.is_empty()).cloned());
        let mut per_user: HashMap<String, Vec<String>> = HashMap::with_capacity(users.len());
        let mut unresolved = users.clone();

        for source in &self.sources {
            if unresolved.is_empty() {
                break;
            }

            let found = source.lookup(&unresolved).await?;
            unresolved.retain(|user_id| {
                let usable: Vec<String> = found
                    .get(user_id)
                    .into_iter()
                    .flatten()
                    .filter(|t| is_well_formed(t))
                    .cloned()
                    .collect();
                if usable.is_empty() {
                    return true;
                }
                per_user.insert(user_id.clone(), usable);
                false
            });

            tracing::trace!(
                source = source.name(),
                remaining = unresolved.len(),
                "Token source consulted"
            );
        }

        Ok(users
            .iter()
            .filter_map(|u| per_user.remove(u))
            .flatten()
            .collect())
    }
}

/// Drop repeats, keeping the first occurrence.
pub fn dedupe<I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
