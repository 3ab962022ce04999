//! Fan-out of one message to many tokens through a `PushGateway`.

use std::sync::Arc;

use tokio::task::JoinSet;

use beacon_common::types::{TokenFailure, redact_token};
use beacon_notifier::{
    DeliveryError, DeliveryErrorCode, NotifierError, PushGateway, PushMessage, TokenOutcome,
    TokenResult,
};

/// Aggregate of every batch sent for a job.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub success_count: usize,
    pub failed_count: usize,
    /// Redacted, in token order
    pub failures: Vec<TokenFailure>,
    /// Full tokens the provider rejected as no longer valid
    pub invalid_tokens: Vec<String>,
}

impl DeliveryReport {
    fn record_failure(&mut self, token: &str, error: &DeliveryError) {
        self.failed_count += 1;
        self.failures.push(TokenFailure {
            token: redact_token(token),
            code: error.code.as_str().to_string(),
            message: error.message.clone(),
        });
        if error.code.is_token_invalid() {
            self.invalid_tokens.push(token.to_string());
        }
    }
}

pub struct Deliverer {
    gateway: Arc<dyn PushGateway>,
}

impl Deliverer {
    pub fn new(gateway: Arc<dyn PushGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    pub fn is_simulated(&self) -> bool {
        self.gateway.is_simulated()
    }

    /// Send `message` to every token, in provider-sized batches sent concurrently.
    ///
    /// A batch that fails outright counts all of its tokens as failed; the
    /// other batches are unaffected.
    pub async fn deliver(&self, message: &PushMessage, tokens: &[String]) -> DeliveryReport {
        let batch_size = self.gateway.max_batch_size().max(1);
        let chunks: Vec<&[String]> = tokens.chunks(batch_size).collect();
        let message = Arc::new(message.clone());
        let mut tasks = JoinSet::new();

        for (index, chunk) in chunks.iter().enumerate() {
            let gateway = self.gateway.clone();
            let message = message.clone();
            let batch = chunk.to_vec();
            tasks.spawn(async move { (index, gateway.send_multicast(&message, &batch).await) });
        }

        let mut results: Vec<Option<Result<Vec<TokenResult>, NotifierError>>> =
            chunks.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "Delivery batch task panicked"),
            }
        }

        let mut report = DeliveryReport::default();

        for (index, (batch, result)) in chunks.into_iter().zip(results).enumerate() {
            match result {
                Some(Ok(results)) => {
                    for token in batch.iter().skip(results.len()) {
                        report.record_failure(
                            token,
                            &DeliveryError::new(
                                DeliveryErrorCode::Unknown,
                                "No result returned for token",
                            ),
                        );
                    }
                    for result in results {
                        match &result.outcome {
                            TokenOutcome::Delivered { .. } => report.success_count += 1,
                            TokenOutcome::Failed(error) => {
                                report.record_failure(&result.token, error)
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        gateway = self.gateway.name(),
                        batch = index,
                        tokens = batch.len(),
                        error = %e,
                        "Batch send failed"
                    );
                    let error = DeliveryError::new(e.code(), e.to_string());
                    for token in batch {
                        report.record_failure(token, &error);
                    }
                }
                None => {
                    let error = DeliveryError::new(DeliveryErrorCode::Internal, "Batch task failed");
                    for token in batch {
                        report.record_failure(token, &error);
                    }
                }
            }
        }

        report
    }
}
