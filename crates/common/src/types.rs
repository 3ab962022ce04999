use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of per-token failures persisted on a job.
pub const MAX_ERROR_SAMPLES: usize = 10;

/// Lifecycle state of a dispatch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    NoTokens,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::NoTokens => "no_tokens",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed | JobStatus::NoTokens)
    }

    /// The only legal edges of the job state machine.
    ///
    /// `Processing -> Pending` is reserved for the recovery sweep.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Pending) => true,
            (JobStatus::Processing, to) => to.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            "no_tokens" => Ok(JobStatus::NoTokens),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Delivery priority requested by the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    High,
    Normal,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
        }
    }
}

/// A per-token delivery failure as persisted on the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFailure {
    /// Redacted token (see [`redact_token`])
    pub token: String,
    /// Classified error code (e.g. `unregistered`)
    pub code: String,
    pub message: String,
}

/// One notification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DispatchJob {
    pub id: String,
    pub status: JobStatus,
    pub title: String,
    pub body: String,
    #[sqlx(json)]
    pub data: HashMap<String, String>,
    pub target_user_ids: Vec<String>,
    pub explicit_tokens: Option<Vec<String>>,
    pub sender_user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Priority,
    /// Producer-assigned epoch milliseconds
    pub created_at_millis: i64,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[sqlx(json)]
    pub last_errors: Vec<TokenFailure>,
    pub success_count: i32,
    pub failed_count: i32,
    pub token_count: i32,
    pub error: Option<String>,
    /// Claim counter; identifies which claim currently owns the job
    pub attempt: i32,
    /// Finalized by the dry-run gateway; nothing was actually sent
    pub dry_run: bool,
}

impl DispatchJob {
    /// A fresh `pending` job as a producer would write it.
    pub fn pending(
        id: impl Into<String>,
        target_user_ids: Vec<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at_millis: i64,
    ) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            title: title.into(),
            body: body.into(),
            data: HashMap::new(),
            target_user_ids,
            explicit_tokens: None,
            sender_user_id: None,
            correlation_id: None,
            priority: Priority::default(),
            created_at_millis,
            processing_started_at: None,
            sent_at: None,
            updated_at: None,
            last_errors: Vec::new(),
            success_count: 0,
            failed_count: 0,
            token_count: 0,
            error: None,
            attempt: 0,
            dry_run: false,
        }
    }

    /// Provider-side collapse/thread key.
    pub fn correlation_key(&self) -> &str {
        self.correlation_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.id)
    }

    /// Explicit tokens, if the producer supplied a non-empty list.
    pub fn explicit_tokens(&self) -> Option<&[String]> {
        self.explicit_tokens
            .as_deref()
            .filter(|tokens| !tokens.is_empty())
    }
}

/// Terminal result of one processing attempt, written back to the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub success_count: i32,
    pub failed_count: i32,
    pub token_count: i32,
    pub errors: Vec<TokenFailure>,
    pub error: Option<String>,
    pub dry_run: bool,
}

impl JobOutcome {
    /// Resolution produced nothing to send to.
    pub fn no_tokens(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::NoTokens,
            success_count: 0,
            failed_count: 0,
            token_count: 0,
            errors: Vec::new(),
            error: Some(reason.into()),
            dry_run: false,
        }
    }

    /// `sent` if anything got through, `failed` otherwise.
    pub fn from_delivery(success_count: usize, failed_count: usize, failures: &[TokenFailure]) -> Self {
        let status = if success_count > 0 {
            JobStatus::Sent
        } else {
            JobStatus::Failed
        };
        let error = (status == JobStatus::Failed).then(|| {
            format!("All {} token(s) failed", failed_count)
        });

        Self {
            status,
            success_count: success_count as i32,
            failed_count: failed_count as i32,
            token_count: (success_count + failed_count) as i32,
            errors: failures.iter().take(MAX_ERROR_SAMPLES).cloned().collect(),
            error,
            dry_run: false,
        }
    }

    /// Mark the outcome as produced without contacting the provider.
    pub fn simulated(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A delivery token held in the per-token sub-record shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceToken {
    pub token: String,
    pub platform: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl DeviceToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            platform: None,
            last_seen_at: None,
        }
    }

    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen_at = Some(at);
        self
    }
}

/// A user record that lists a given token.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TokenClaim {
    pub user_id: String,
    /// Only sub-records carry a last-seen time
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Shorten a token for logs and persisted diagnostics.
pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if prefix.len() < token.len() {
        format!("{}…", prefix)
    } else {
        prefix
    }
}
