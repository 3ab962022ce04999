use std::str::FromStr;

use serde::Deserialize;

/// Lower bound for `SWEEP_INTERVAL_MS`.
pub const MIN_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Lower bound for `PROCESSING_TIMEOUT_MS`. Shorter timeouts would hand
/// in-flight claims back to `pending` on every sweep.
pub const MIN_PROCESSING_TIMEOUT_MS: u64 = 60_000;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Path to the Google service-account key used to mint FCM access tokens
    pub fcm_credentials_path: Option<String>,

    /// Firebase project id (falls back to the one in the service-account key)
    pub fcm_project_id: Option<String>,

    /// FCM API base URL (overridable for emulators)
    pub fcm_endpoint: String,

    /// Concurrent provider requests within one multicast batch (default: 50)
    pub fcm_request_concurrency: usize,

    /// Resolve and log recipients without sending anything
    pub dry_run: bool,

    /// Number of concurrent dispatch workers (default: 3)
    pub worker_concurrency: usize,

    /// Capacity of the in-process work queue (default: 1000)
    pub queue_capacity: usize,

    /// Pending jobs fetched per live notification (default: 10)
    pub intake_page_size: i64,

    /// Sweep period in milliseconds (default: 30000, min: 1000)
    pub sweep_interval_ms: u64,

    /// Jobs fetched per sweep query (default: 100)
    pub sweep_page_size: i64,

    /// A job stuck in `processing` longer than this is handed back to `pending` (default: 300000, min: 60000)
    pub processing_timeout_ms: u64,

    /// Drop the sender's own devices from the recipient set
    pub exclude_sender: bool,

    /// Drop tokens whose current owners are not among the job's targets
    pub enforce_ownership: bool,

    /// Remove dropped tokens from the records of their non-recipient owners
    pub ownership_cleanup: bool,

    /// Maximum number of cached token owner lookups (default: 10000)
    pub owner_cache_capacity: usize,

    /// Bind address for the health/status endpoints
    pub health_addr: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database_url: var("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_or(&var, "DB_MAX_CONNECTIONS", 10)?,
            fcm_credentials_path: var("FCM_CREDENTIALS_PATH"),
            fcm_project_id: var("FCM_PROJECT_ID"),
            fcm_endpoint: var("FCM_ENDPOINT")
                .unwrap_or_else(|| "https://fcm.googleapis.com".to_string()),
            fcm_request_concurrency: parse_or(&var, "FCM_REQUEST_CONCURRENCY", 50)?,
            dry_run: flag_or(&var, "DISPATCH_DRY_RUN", false)?,
            worker_concurrency: parse_or(&var, "WORKER_CONCURRENCY", 3)?,
            queue_capacity: parse_or(&var, "WORKER_QUEUE_CAPACITY", 1000)?,
            intake_page_size: parse_or(&var, "INTAKE_PAGE_SIZE", 10)?,
            sweep_interval_ms: at_least(
                "SWEEP_INTERVAL_MS",
                parse_or(&var, "SWEEP_INTERVAL_MS", 30_000)?,
                MIN_SWEEP_INTERVAL_MS,
            ),
            sweep_page_size: parse_or(&var, "SWEEP_PAGE_SIZE", 100)?,
            processing_timeout_ms: at_least(
                "PROCESSING_TIMEOUT_MS",
                parse_or(&var, "PROCESSING_TIMEOUT_MS", 300_000)?,
                MIN_PROCESSING_TIMEOUT_MS,
            ),
            exclude_sender: flag_or(&var, "EXCLUDE_SENDER", true)?,
            enforce_ownership: flag_or(&var, "ENFORCE_OWNERSHIP", true)?,
            ownership_cleanup: flag_or(&var, "OWNERSHIP_CLEANUP", false)?,
            owner_cache_capacity: parse_or(&var, "OWNER_CACHE_CAPACITY", 10_000)?,
            health_addr: var("HEALTH_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }

    /// Reject values that would stall the worker.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("WORKER_QUEUE_CAPACITY must be at least 1");
        }
        if self.intake_page_size <= 0 || self.sweep_page_size <= 0 {
            anyhow::bail!("INTAKE_PAGE_SIZE and SWEEP_PAGE_SIZE must be positive");
        }
        if self.sweep_interval_ms < MIN_SWEEP_INTERVAL_MS {
            anyhow::bail!("SWEEP_INTERVAL_MS must be at least {}", MIN_SWEEP_INTERVAL_MS);
        }
        if self.processing_timeout_ms < MIN_PROCESSING_TIMEOUT_MS {
            anyhow::bail!(
                "PROCESSING_TIMEOUT_MS must be at least {}",
                MIN_PROCESSING_TIMEOUT_MS
            );
        }
        if !self.dry_run && self.fcm_credentials_path.is_none() {
            anyhow::bail!("FCM_CREDENTIALS_PATH is required unless DISPATCH_DRY_RUN is set");
        }
        Ok(())
    }
}

fn at_least(key: &str, value: u64, min: u64) -> u64 {
    if value < min {
        tracing::warn!(key, value, min, "Configured value below minimum, clamping");
        return min;
    }
    value
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn flag_or<F>(var: &F, key: &str, default: bool) -> anyhow::Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key).as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("FALSE") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(anyhow::anyhow!(
            "{} must be a boolean (true/false), got {:?}",
            key,
            other
        )),
    }
}
