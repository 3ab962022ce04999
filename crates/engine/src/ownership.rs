//! Ownership enforcement: keeps a job's notification on its recipients' devices.
//!
//! A token can be re-registered to a different user when an app is
//! reinstalled, leaving a copy on the previous user's records. Before
//! sending, every candidate token is checked against the users that claim it:
//! 1. Gather claims from both storage shapes (inline list + sub-records)
//! 2. Allow the token if nobody claims it or any claimant is a target
//! 3. Otherwise drop it and, in cleanup mode, remove it from the claimants
//!
//! Owner sets are cached per process. The cache is bounded, never persisted,
//! and only trades read cost for freshness; it is not a source of truth.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use beacon_common::error::AppError;
use beacon_common::types::{TokenClaim, redact_token};

use crate::store::DeviceStore;

/// Users associated with a token across both storage shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerSet {
    pub users: BTreeSet<String>,
    /// Most recent sub-record registration, if any carries a timestamp
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl OwnerSet {
    pub fn from_claims(claims: &[TokenClaim]) -> Self {
        Self {
            users: claims.iter().map(|c| c.user_id.clone()).collect(),
            last_seen_at: claims.iter().filter_map(|c| c.last_seen_at).max(),
        }
    }

    /// No ownership metadata at all.
    pub fn is_unknown(&self) -> bool {
        self.users.is_empty()
    }

    /// Unknown ownership is allowed; known ownership must intersect the targets.
    pub fn allows(&self, targets: &[String]) -> bool {
        self.is_unknown() || targets.iter().any(|t| self.users.contains(t))
    }

    /// Claimants that are not recipients of the job.
    pub fn outside<'a>(&'a self, targets: &'a [String]) -> impl Iterator<Item = &'a String> + 'a {
        self.users.iter().filter(move |u| !targets.contains(*u))
    }
}

/// Bounded FIFO cache of owner lookups keyed by token.
pub struct OwnerCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, OwnerSet>,
    order: VecDeque<String>,
}

impl OwnerCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub async fn get(&self, token: &str) -> Option<OwnerSet> {
        self.inner.lock().await.entries.get(token).cloned()
    }

    pub async fn insert(&self, token: &str, owners: OwnerSet) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.entries.insert(token.to_string(), owners).is_none() {
            inner.order.push_back(token.to_string());
        }

        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub async fn invalidate(&self, token: &str) {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(token).is_some() {
            inner.order.retain(|t| t != token);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// A token withheld from a send because its owners are not recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedToken {
    pub token: String,
    pub owners: OwnerSet,
}

#[derive(Debug, Default)]
pub struct OwnershipReport {
    pub allowed: Vec<String>,
    pub dropped: Vec<DroppedToken>,
    /// Registrations removed from non-recipients' records (cleanup mode)
    pub cleaned: u64,
}

pub struct OwnershipResolver {
    devices: Arc<dyn DeviceStore>,
    cache: Arc<OwnerCache>,
    cleanup: bool,
}

impl OwnershipResolver {
    pub fn new(devices: Arc<dyn DeviceStore>, cache: Arc<OwnerCache>, cleanup: bool) -> Self {
        Self {
            devices,
            cache,
            cleanup,
        }
    }

    /// Owners of a token, checking both storage shapes.
    pub async fn owners(&self, token: &str) -> Result<OwnerSet, AppError> {
        if let Some(cached) = self.cache.get(token).await {
            return Ok(cached);
        }

        let mut claims = self.devices.inline_claims(token).await?;
        claims.extend(self.devices.sub_record_claims(token).await?);

        let owners = OwnerSet::from_claims(&claims);
        self.cache.insert(token, owners.clone()).await;
        Ok(owners)
    }

    /// Split candidate tokens into those deliverable to `targets` and those dropped.
    pub async fn filter(
        &self,
        tokens: Vec<String>,
        targets: &[String],
    ) -> Result<OwnershipReport, AppError> {
        let mut report = OwnershipReport::default();

        for token in tokens {
            let owners = self.owners(&token).await?;
            if owners.allows(targets) {
                report.allowed.push(token);
                continue;
            }

            tracing::warn!(
                token = %redact_token(&token),
                owners = ?owners.users,
                last_seen_at = ?owners.last_seen_at,
                "Dropping token owned by a non-recipient"
            );
            report.dropped.push(DroppedToken { token, owners });
        }

        if self.cleanup {
            for dropped in &report.dropped {
                report.cleaned += self.clean_foreign_owners(dropped, targets).await;
            }
        }

        Ok(report)
    }

    /// Remove a dropped token from the records of its non-recipient owners.
    /// Best-effort: failures are logged and never block the send.
    async fn clean_foreign_owners(&self, dropped: &DroppedToken, targets: &[String]) -> u64 {
        let mut removed = 0;

        for user_id in dropped.owners.outside(targets) {
            match self.devices.remove_user_token(user_id, &dropped.token).await {
                Ok(count) => {
                    removed += count;
                    tracing::info!(
                        user_id = %user_id,
                        token = %redact_token(&dropped.token),
                        "Removed token registration held by a non-recipient"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        token = %redact_token(&dropped.token),
                        error = %e,
                        "Ownership cleanup failed"
                    );
                }
            }
        }

        if removed > 0 {
            self.cache.invalidate(&dropped.token).await;
        }

        removed
    }
}
