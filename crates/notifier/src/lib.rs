//! Push delivery gateway.
//!
//! A thin adapter over an external multicast-capable push provider:
//! - `fcm::FcmGateway` delivers through the FCM HTTP v1 API
//! - `dry_run::DryRunGateway` logs what would be sent and reports success
//!
//! Both report one `TokenResult` per token, with failures classified so the
//! caller can tell a permanently invalid token from a provider hiccup.

pub mod auth;
pub mod dry_run;
pub mod fcm;
pub mod message;

use async_trait::async_trait;
use thiserror::Error;

pub use message::PushMessage;

/// Errors that fail a whole batch rather than a single token.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Authentication error: {0}")]
    Auth(String),
}

impl NotifierError {
    /// Classification applied to every token of a batch that failed outright.
    pub fn code(&self) -> DeliveryErrorCode {
        match self {
            NotifierError::Http(_) => DeliveryErrorCode::Transport,
            NotifierError::Credentials(_) | NotifierError::Auth(_) => DeliveryErrorCode::AuthError,
        }
    }
}

/// Classified per-token failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryErrorCode {
    /// The app instance was uninstalled or the token expired
    Unregistered,
    /// The token is malformed or was never issued
    InvalidToken,
    SenderIdMismatch,
    QuotaExceeded,
    Unavailable,
    Internal,
    ThirdPartyAuthError,
    InvalidArgument,
    AuthError,
    Transport,
    Unknown,
}

impl DeliveryErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryErrorCode::Unregistered => "unregistered",
            DeliveryErrorCode::InvalidToken => "invalid_token",
            DeliveryErrorCode::SenderIdMismatch => "sender_id_mismatch",
            DeliveryErrorCode::QuotaExceeded => "quota_exceeded",
            DeliveryErrorCode::Unavailable => "unavailable",
            DeliveryErrorCode::Internal => "internal",
            DeliveryErrorCode::ThirdPartyAuthError => "third_party_auth_error",
            DeliveryErrorCode::InvalidArgument => "invalid_argument",
            DeliveryErrorCode::AuthError => "auth_error",
            DeliveryErrorCode::Transport => "transport",
            DeliveryErrorCode::Unknown => "unknown",
        }
    }

    /// The token will never work again and should be pruned.
    pub fn is_token_invalid(&self) -> bool {
        matches!(
            self,
            DeliveryErrorCode::Unregistered | DeliveryErrorCode::InvalidToken
        )
    }

    /// The provider may accept the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryErrorCode::QuotaExceeded
                | DeliveryErrorCode::Unavailable
                | DeliveryErrorCode::Internal
                | DeliveryErrorCode::Transport
        )
    }
}

impl std::fmt::Display for DeliveryErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified delivery failure for one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    pub code: DeliveryErrorCode,
    pub message: String,
}

impl DeliveryError {
    pub fn new(code: DeliveryErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of delivering to a single token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Delivered { message_id: String },
    Failed(DeliveryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResult {
    pub token: String,
    pub outcome: TokenOutcome,
}

impl TokenResult {
    pub fn delivered(token: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            outcome: TokenOutcome::Delivered {
                message_id: message_id.into(),
            },
        }
    }

    pub fn failed(token: impl Into<String>, error: DeliveryError) -> Self {
        Self {
            token: token.into(),
            outcome: TokenOutcome::Failed(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TokenOutcome::Delivered { .. })
    }
}

/// Trait that every push provider adapter implements.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Human-readable name for logs (e.g. "fcm").
    fn name(&self) -> &'static str;

    /// Largest token batch accepted by one `send_multicast` call.
    fn max_batch_size(&self) -> usize;

    /// True when results are fabricated locally instead of sent.
    fn is_simulated(&self) -> bool {
        false
    }

    /// Deliver one payload to every token in `tokens`.
    ///
    /// Returns one result per token, in input order. An `Err` means nothing in
    /// the batch was attempted.
    async fn send_multicast(
        &self,
        message: &PushMessage,
        tokens: &[String],
    ) -> Result<Vec<TokenResult>, NotifierError>;
}
