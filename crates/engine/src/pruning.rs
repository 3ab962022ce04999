//! Removal of tokens the provider reported as permanently invalid.

use std::sync::Arc;

use beacon_common::types::redact_token;

use crate::ownership::OwnerCache;
use crate::store::DeviceStore;

pub struct TokenPruner {
    devices: Arc<dyn DeviceStore>,
    cache: Arc<OwnerCache>,
}

impl TokenPruner {
    pub fn new(devices: Arc<dyn DeviceStore>, cache: Arc<OwnerCache>) -> Self {
        Self { devices, cache }
    }

    /// Strip each token from every user record in both shapes.
    ///
    /// Best-effort: failures are logged and the remaining tokens still run.
    /// Returns the number of registry entries removed.
    pub async fn prune(&self, tokens: &[String]) -> u64 {
        let mut removed = 0;

        for token in tokens {
            match self.devices.remove_token(token).await {
                Ok(count) => {
                    removed += count;
                    self.cache.invalidate(token).await;
                    tracing::info!(
                        token = %redact_token(token),
                        entries = count,
                        "Pruned invalid token"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        token = %redact_token(token),
                        error = %e,
                        "Failed to prune invalid token"
                    );
                }
            }
        }

        removed
    }
}
