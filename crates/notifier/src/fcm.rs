//! FCM HTTP v1 gateway.
//!
//! HTTP v1 has no multicast endpoint, so a "multicast" is one
//! `messages:send` request per token, issued concurrently (bounded by a
//! semaphore) with a single access token shared by the batch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use beacon_common::types::redact_token;

use crate::auth::AccessTokenProvider;
use crate::{
    DeliveryError, DeliveryErrorCode, NotifierError, PushGateway, PushMessage, TokenResult,
};

/// Largest batch accepted per `send_multicast` call (matches the Admin SDK limit).
pub const FCM_MAX_BATCH_SIZE: usize = 500;

/// FCM HTTP v1 client.
pub struct FcmGateway {
    client: reqwest::Client,
    auth: Arc<AccessTokenProvider>,
    send_url: String,
    permits: Arc<Semaphore>,
}

impl FcmGateway {
    pub fn new(
        client: reqwest::Client,
        auth: AccessTokenProvider,
        endpoint: &str,
        project_id: &str,
        request_concurrency: usize,
    ) -> Self {
        let send_url = format!(
            "{}/v1/projects/{}/messages:send",
            endpoint.trim_end_matches('/'),
            project_id
        );

        tracing::info!(url = %send_url, request_concurrency, "FCM gateway configured");

        Self {
            client,
            auth: Arc::new(auth),
            send_url,
            permits: Arc::new(Semaphore::new(request_concurrency.max(1))),
        }
    }

    async fn send_one(
        client: reqwest::Client,
        url: String,
        bearer: String,
        token: String,
        body: serde_json::Value,
    ) -> TokenResult {
        let response = match client.post(&url).bearer_auth(&bearer).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                return TokenResult::failed(
                    token,
                    DeliveryError::new(DeliveryErrorCode::Transport, e.to_string()),
                );
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return TokenResult::failed(
                    token,
                    DeliveryError::new(DeliveryErrorCode::Transport, e.to_string()),
                );
            }
        };

        if status.is_success() {
            let message_id = serde_json::from_str::<SendResponse>(&text)
                .map(|r| r.name)
                .unwrap_or_default();
            return TokenResult::delivered(token, message_id);
        }

        let error = classify_error(status.as_u16(), &text);
        tracing::debug!(
            token = %redact_token(&token),
            status = status.as_u16(),
            code = %error.code,
            "FCM rejected token"
        );
        TokenResult::failed(token, error)
    }
}

#[async_trait]
impl PushGateway for FcmGateway {
    fn name(&self) -> &'static str {
        "fcm"
    }

    fn max_batch_size(&self) -> usize {
        FCM_MAX_BATCH_SIZE
    }

    async fn send_multicast(
        &self,
        message: &PushMessage,
        tokens: &[String],
    ) -> Result<Vec<TokenResult>, NotifierError> {
        let bearer = self.auth.access_token().await?;
        let mut tasks = JoinSet::new();

        for (index, token) in tokens.iter().enumerate() {
            let permits = self.permits.clone();
            let client = self.client.clone();
            let url = self.send_url.clone();
            let bearer = bearer.clone();
            let token = token.clone();
            let body = message.to_fcm_request(&token);

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, Self::send_one(client, url, bearer, token, body).await)
            });
        }

        let mut slots: Vec<Option<TokenResult>> = vec![None; tokens.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "FCM send task panicked"),
            }
        }

        Ok(slots
            .into_iter()
            .zip(tokens)
            .map(|(slot, token)| {
                slot.unwrap_or_else(|| {
                    TokenResult::failed(
                        token.clone(),
                        DeliveryError::new(DeliveryErrorCode::Internal, "send task aborted"),
                    )
                })
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

/// Classify an FCM HTTP v1 error response.
///
/// The FCM-specific `errorCode` detail wins over the generic RPC status,
/// which in turn wins over the bare HTTP status. Only an explicit
/// `UNREGISTERED` detail marks a token as gone: a 404 or `NOT_FOUND` without
/// it may come from a misrouted endpoint or a proxy and is `Unknown`.
pub fn classify_error(http_status: u16, body: &str) -> DeliveryError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let status = envelope.error;

    let fcm_code = status
        .details
        .iter()
        .find_map(|d| d.error_code.clone())
        .unwrap_or_else(|| status.status.clone());

    let message = if status.message.is_empty() {
        format!("HTTP {}", http_status)
    } else {
        status.message.clone()
    };

    let code = match fcm_code.as_str() {
        "UNREGISTERED" => DeliveryErrorCode::Unregistered,
        "INVALID_ARGUMENT" => {
            if message.to_lowercase().contains("registration token") {
                DeliveryErrorCode::InvalidToken
            } else {
                DeliveryErrorCode::InvalidArgument
            }
        }
        "SENDER_ID_MISMATCH" => DeliveryErrorCode::SenderIdMismatch,
        "QUOTA_EXCEEDED" | "RESOURCE_EXHAUSTED" => DeliveryErrorCode::QuotaExceeded,
        "UNAVAILABLE" => DeliveryErrorCode::Unavailable,
        "INTERNAL" => DeliveryErrorCode::Internal,
        "THIRD_PARTY_AUTH_ERROR" => DeliveryErrorCode::ThirdPartyAuthError,
        "UNAUTHENTICATED" | "PERMISSION_DENIED" => DeliveryErrorCode::AuthError,
        "NOT_FOUND" => DeliveryErrorCode::Unknown,
        _ => match http_status {
            400 => DeliveryErrorCode::InvalidArgument,
            401 | 403 => DeliveryErrorCode::AuthError,
            429 => DeliveryErrorCode::QuotaExceeded,
            500 => DeliveryErrorCode::Internal,
            502..=504 => DeliveryErrorCode::Unavailable,
            _ => DeliveryErrorCode::Unknown,
        },
    };

    DeliveryError::new(code, message)
}
