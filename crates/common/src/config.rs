use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (job broker)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Firebase project that owns the device tokens
    pub fcm_project_id: String,

    /// Base URL of the FCM HTTP v1 API (overridable for emulators)
    pub fcm_endpoint: String,

    /// Static OAuth access token. When unset, application-default credentials are used.
    pub fcm_access_token: Option<String>,

    /// Per-request provider timeout, kept below the job lease (default: 30)
    pub fcm_timeout_secs: u64,

    /// Maximum in-flight provider requests while fanning out a batch (default: 16)
    pub fcm_send_concurrency: usize,

    /// Attempt cap for the single queue and for per-notification retries (default: 3)
    pub max_retry_attempts: u32,

    /// Base delay for the single queue's exponential backoff (default: 5000)
    pub retry_delay_ms: u64,

    /// Base delay for the batch queue's exponential backoff (default: 10000)
    pub batch_retry_delay_ms: u64,

    /// Fixed delay applied to jobs on the retry queue (default: 30000)
    pub retry_queue_delay_ms: u64,

    /// Prefix for every Redis key owned by the broker
    pub queue_prefix: String,

    /// How long a claimed job stays leased before it is redelivered
    pub job_lease_secs: u64,

    /// Idle sleep between claim attempts when a queue is empty
    pub worker_poll_interval_ms: u64,

    /// Interval between scheduled-notification sweeps (default: 60)
    pub scheduler_interval_secs: u64,

    /// Age after which a `processing` row is considered abandoned (default: 1800)
    pub stale_processing_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            fcm_project_id: std::env::var("FCM_PROJECT_ID")
                .map_err(|_| anyhow::anyhow!("FCM_PROJECT_ID environment variable is required"))?,
            fcm_endpoint: std::env::var("FCM_ENDPOINT")
                .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
            fcm_access_token: std::env::var("FCM_ACCESS_TOKEN").ok(),
            fcm_timeout_secs: parse_var("FCM_TIMEOUT_SECS", 30)?,
            fcm_send_concurrency: parse_var("FCM_SEND_CONCURRENCY", 16)?,
            max_retry_attempts: parse_var("MAX_RETRY_ATTEMPTS", 3)?,
            retry_delay_ms: parse_var("RETRY_DELAY_MS", 5000)?,
            batch_retry_delay_ms: parse_var("BATCH_RETRY_DELAY_MS", 10_000)?,
            retry_queue_delay_ms: parse_var("RETRY_QUEUE_DELAY_MS", 30_000)?,
            queue_prefix: std::env::var("QUEUE_PREFIX").unwrap_or_else(|_| "beacon".to_string()),
            job_lease_secs: parse_var("JOB_LEASE_SECS", 300)?,
            worker_poll_interval_ms: parse_var("WORKER_POLL_INTERVAL_MS", 500)?,
            scheduler_interval_secs: parse_var("SCHEDULER_INTERVAL_SECS", 60)?,
            stale_processing_secs: parse_var("STALE_PROCESSING_SECS", 1800)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// A provider call must give up before its job and notification leases expire.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fcm_timeout_secs == 0 || self.fcm_timeout_secs >= self.job_lease_secs {
            anyhow::bail!(
                "FCM_TIMEOUT_SECS ({}) must be non-zero and below JOB_LEASE_SECS ({})",
                self.fcm_timeout_secs,
                self.job_lease_secs
            );
        }
        Ok(())
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
