//! Configuration for the hookguard service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookguard_processing::{
    ConfirmationTokens, PreviousSecret, RunnerConfig, SignatureVerifier, StoreRetry,
    SweeperConfig,
};
use serde::{Deserialize, Serialize};

use crate::middleware::auth::OperatorKeys;

const CONFIG_FILE: &str = "config.toml";

/// Complete service configuration.
///
/// Loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// The signing and confirmation secrets have no usable default; the service
/// refuses to start until both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Attempts to reach the database at startup.
    ///
    /// Environment variable: `DATABASE_CONNECT_ATTEMPTS`
    #[serde(default = "default_connect_attempts", alias = "DATABASE_CONNECT_ATTEMPTS")]
    pub database_connect_attempts: u32,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,
    /// Largest accepted delivery body in bytes.
    ///
    /// Environment variable: `MAX_PAYLOAD_BYTES`
    #[serde(default = "default_max_payload_bytes", alias = "MAX_PAYLOAD_BYTES")]
    pub max_payload_bytes: usize,

    // Signatures
    /// Active HMAC secret shared with the bot.
    ///
    /// Environment variable: `SIGNING_SECRET`
    #[serde(default, alias = "SIGNING_SECRET")]
    pub signing_secret: String,
    /// Secret being rotated out, accepted until `previous_secret_valid_until`.
    ///
    /// Environment variable: `PREVIOUS_SIGNING_SECRET`
    #[serde(default, alias = "PREVIOUS_SIGNING_SECRET")]
    pub previous_signing_secret: Option<String>,
    /// RFC 3339 instant after which the previous secret is rejected.
    ///
    /// Environment variable: `PREVIOUS_SECRET_VALID_UNTIL`
    #[serde(default, alias = "PREVIOUS_SECRET_VALID_UNTIL")]
    pub previous_secret_valid_until: Option<DateTime<Utc>>,
    /// Header carrying the delivery signature.
    ///
    /// Environment variable: `SIGNATURE_HEADER`
    #[serde(default = "default_signature_header", alias = "SIGNATURE_HEADER")]
    pub signature_header: String,

    // Replay
    /// Key for force-replay confirmation tokens.
    ///
    /// Environment variable: `CONFIRMATION_SECRET`
    #[serde(default, alias = "CONFIRMATION_SECRET")]
    pub confirmation_secret: String,
    /// Lifetime of a confirmation token in seconds.
    ///
    /// Environment variable: `REPLAY_CONFIRMATION_TTL_SECONDS`
    #[serde(default = "default_confirmation_ttl", alias = "REPLAY_CONFIRMATION_TTL_SECONDS")]
    pub replay_confirmation_ttl_seconds: u64,

    // Operators
    /// Comma-separated `user_id:sha256hex` pairs.
    ///
    /// Environment variable: `OPERATOR_KEYS`
    #[serde(default, alias = "OPERATOR_KEYS")]
    pub operator_keys: String,

    // Ingestion
    /// Insert attempts before answering 503.
    ///
    /// Environment variable: `STORE_RETRY_ATTEMPTS`
    #[serde(default = "default_store_retry_attempts", alias = "STORE_RETRY_ATTEMPTS")]
    pub store_retry_attempts: u32,
    /// Base delay between insert attempts in milliseconds.
    ///
    /// Environment variable: `STORE_RETRY_DELAY_MS`
    #[serde(default = "default_store_retry_delay_ms", alias = "STORE_RETRY_DELAY_MS")]
    pub store_retry_delay_ms: u64,

    // Sweeper
    /// Seconds between pending sweeps.
    ///
    /// Environment variable: `SWEEPER_INTERVAL_SECONDS`
    #[serde(default = "default_sweeper_interval", alias = "SWEEPER_INTERVAL_SECONDS")]
    pub sweeper_interval_seconds: u64,
    /// Age in seconds after which a pending event counts as stranded.
    ///
    /// Environment variable: `STALE_PENDING_SECONDS`
    #[serde(default = "default_stale_pending", alias = "STALE_PENDING_SECONDS")]
    pub stale_pending_seconds: u64,
    /// Events re-dispatched per sweep.
    ///
    /// Environment variable: `SWEEPER_BATCH_SIZE`
    #[serde(default = "default_sweeper_batch_size", alias = "SWEEPER_BATCH_SIZE")]
    pub sweeper_batch_size: usize,

    // Scheduler
    /// Job runner idle poll interval in milliseconds.
    ///
    /// Environment variable: `SCHEDULER_POLL_INTERVAL_MS`
    #[serde(default = "default_scheduler_poll_ms", alias = "SCHEDULER_POLL_INTERVAL_MS")]
    pub scheduler_poll_interval_ms: u64,
    /// Jobs claimed per poll.
    ///
    /// Environment variable: `SCHEDULER_BATCH_SIZE`
    #[serde(default = "default_scheduler_batch_size", alias = "SCHEDULER_BATCH_SIZE")]
    pub scheduler_batch_size: usize,
    /// Executions started before a failing job is given up.
    ///
    /// Environment variable: `SCHEDULER_MAX_ATTEMPTS`
    #[serde(default = "default_scheduler_max_attempts", alias = "SCHEDULER_MAX_ATTEMPTS")]
    pub scheduler_max_attempts: u32,
    /// Backoff unit between job retries, in seconds.
    ///
    /// Environment variable: `SCHEDULER_RETRY_DELAY_SECONDS`
    #[serde(default = "default_scheduler_retry_delay", alias = "SCHEDULER_RETRY_DELAY_SECONDS")]
    pub scheduler_retry_delay_seconds: u64,
    /// Seconds a job may stay running before it counts as abandoned.
    ///
    /// Environment variable: `SCHEDULER_LEASE_SECONDS`
    #[serde(default = "default_scheduler_lease", alias = "SCHEDULER_LEASE_SECONDS")]
    pub scheduler_lease_seconds: u64,
    /// Delay before the purchase follow-up fires, in seconds.
    ///
    /// Environment variable: `FOLLOW_UP_DELAY_SECONDS`
    #[serde(default = "default_follow_up_delay", alias = "FOLLOW_UP_DELAY_SECONDS")]
    pub follow_up_delay_seconds: u64,

    // Notifications
    /// Receiver for outbound notifications; logged only when unset.
    ///
    /// Environment variable: `NOTIFICATION_URL`
    #[serde(default, alias = "NOTIFICATION_URL")]
    pub notification_url: Option<String>,
    /// Notification request timeout in seconds.
    ///
    /// Environment variable: `NOTIFICATION_TIMEOUT_SECONDS`
    #[serde(default = "default_notification_timeout", alias = "NOTIFICATION_TIMEOUT_SECONDS")]
    pub notification_timeout_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads defaults, then `config.toml`, then environment overrides.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the result does not validate.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the server socket address from host and port.
    ///
    /// # Errors
    ///
    /// Fails if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Signature verifier for the configured secrets.
    pub fn signature_verifier(&self) -> SignatureVerifier {
        let verifier = SignatureVerifier::new(self.signing_secret.clone());
        match (&self.previous_signing_secret, self.previous_secret_valid_until) {
            (Some(previous), Some(valid_until)) if !previous.is_empty() => {
                verifier.with_previous(PreviousSecret::new(previous.clone(), valid_until))
            },
            _ => verifier,
        }
    }

    /// Force-replay confirmation token issuer.
    pub fn confirmation_tokens(&self) -> ConfirmationTokens {
        ConfirmationTokens::new(
            self.confirmation_secret.clone(),
            Duration::from_secs(self.replay_confirmation_ttl_seconds),
        )
    }

    /// Parsed operator keys.
    ///
    /// # Errors
    ///
    /// Fails on a malformed `OPERATOR_KEYS` entry.
    pub fn operator_keys(&self) -> Result<OperatorKeys> {
        OperatorKeys::parse(&self.operator_keys)
    }

    /// Insert retry policy.
    pub fn store_retry(&self) -> StoreRetry {
        StoreRetry {
            attempts: self.store_retry_attempts,
            delay: Duration::from_millis(self.store_retry_delay_ms),
        }
    }

    /// Pending sweeper settings.
    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweeper_interval_seconds),
            stale_after: Duration::from_secs(self.stale_pending_seconds),
            batch_size: self.sweeper_batch_size,
        }
    }

    /// Job runner settings.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(self.scheduler_poll_interval_ms),
            batch_size: self.scheduler_batch_size,
            max_attempts: self.scheduler_max_attempts,
            retry_delay: Duration::from_secs(self.scheduler_retry_delay_seconds),
            lease: Duration::from_secs(self.scheduler_lease_seconds),
        }
    }

    /// Purchase follow-up delay.
    pub fn follow_up_delay(&self) -> Duration {
        Duration::from_secs(self.follow_up_delay_seconds)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Names the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.signing_secret.trim().is_empty() {
            anyhow::bail!("signing_secret must be set");
        }

        if self.confirmation_secret.trim().is_empty() {
            anyhow::bail!("confirmation_secret must be set");
        }

        if self.previous_signing_secret.as_deref().is_some_and(|s| !s.is_empty())
            && self.previous_secret_valid_until.is_none()
        {
            anyhow::bail!("previous_signing_secret requires previous_secret_valid_until");
        }

        if self.signature_header.trim().is_empty() {
            anyhow::bail!("signature_header must not be empty");
        }

        if self.max_payload_bytes == 0 {
            anyhow::bail!("max_payload_bytes must be greater than 0");
        }

        if self.store_retry_attempts == 0 {
            anyhow::bail!("store_retry_attempts must be greater than 0");
        }

        if self.sweeper_interval_seconds == 0 || self.scheduler_poll_interval_ms == 0 {
            anyhow::bail!("sweeper and scheduler intervals must be greater than 0");
        }

        if self.sweeper_batch_size == 0 || self.scheduler_batch_size == 0 {
            anyhow::bail!("sweeper and scheduler batch sizes must be greater than 0");
        }

        if self.scheduler_max_attempts == 0 || self.scheduler_lease_seconds == 0 {
            anyhow::bail!("scheduler_max_attempts and scheduler_lease_seconds must be greater than 0");
        }

        if self.replay_confirmation_ttl_seconds == 0 {
            anyhow::bail!("replay_confirmation_ttl_seconds must be greater than 0");
        }

        self.operator_keys().context("invalid operator_keys")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_connect_attempts: default_connect_attempts(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            max_payload_bytes: default_max_payload_bytes(),
            signing_secret: String::new(),
            previous_signing_secret: None,
            previous_secret_valid_until: None,
            signature_header: default_signature_header(),
            confirmation_secret: String::new(),
            replay_confirmation_ttl_seconds: default_confirmation_ttl(),
            operator_keys: String::new(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_delay_ms: default_store_retry_delay_ms(),
            sweeper_interval_seconds: default_sweeper_interval(),
            stale_pending_seconds: default_stale_pending(),
            sweeper_batch_size: default_sweeper_batch_size(),
            scheduler_poll_interval_ms: default_scheduler_poll_ms(),
            scheduler_batch_size: default_scheduler_batch_size(),
            scheduler_max_attempts: default_scheduler_max_attempts(),
            scheduler_retry_delay_seconds: default_scheduler_retry_delay(),
            scheduler_lease_seconds: default_scheduler_lease(),
            follow_up_delay_seconds: default_follow_up_delay(),
            notification_url: None,
            notification_timeout_seconds: default_notification_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/hookguard".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_signature_header() -> String {
    "X-Bot-Signature".to_string()
}

fn default_confirmation_ttl() -> u64 {
    300
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_delay_ms() -> u64 {
    100
}

fn default_sweeper_interval() -> u64 {
    30
}

fn default_stale_pending() -> u64 {
    60
}

fn default_sweeper_batch_size() -> usize {
    50
}

fn default_scheduler_poll_ms() -> u64 {
    1000
}

fn default_scheduler_batch_size() -> usize {
    10
}

fn default_scheduler_max_attempts() -> u32 {
    3
}

fn default_scheduler_retry_delay() -> u64 {
    60
}

fn default_scheduler_lease() -> u64 {
    300
}

fn default_follow_up_delay() -> u64 {
    24 * 3600
}

fn default_notification_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info,hookguard=debug,tower_http=debug".to_string()
}
