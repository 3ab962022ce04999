//! Gateway used when `DISPATCH_DRY_RUN` is set: logs instead of sending.

use async_trait::async_trait;

use beacon_common::types::redact_token;

use crate::{NotifierError, PushGateway, PushMessage, TokenResult};

pub struct DryRunGateway {
    max_batch_size: usize,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self {
            max_batch_size: crate::fcm::FCM_MAX_BATCH_SIZE,
        }
    }
}

impl Default for DryRunGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushGateway for DryRunGateway {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn is_simulated(&self) -> bool {
        true
    }

    async fn send_multicast(
        &self,
        message: &PushMessage,
        tokens: &[String],
    ) -> Result<Vec<TokenResult>, NotifierError> {
        tracing::info!(
            title = %message.title,
            body = %message.body,
            correlation_id = %message.correlation_id,
            tokens = ?tokens.iter().map(|t| redact_token(t)).collect::<Vec<_>>(),
            "[dry-run] would send notification"
        );

        Ok(tokens
            .iter()
            .map(|token| TokenResult::delivered(token.clone(), "dry-run"))
            .collect())
    }
}
