use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Database connection URI (PostgreSQL)
    pub database_url: String,

    /// Maximum number of database connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Address the intake API binds to (default: 0.0.0.0:8000)
    pub listen_addr: SocketAddr,

    /// SMTP relay settings
    pub smtp: SmtpConfig,

    /// Retry policy and scheduler tuning
    pub dispatch: DispatchConfig,
}

/// Connection settings for the outbound SMTP relay.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Login for SMTP AUTH; authentication is skipped when unset
    pub login: Option<String>,
    pub password: Option<String>,
    /// Sender address placed in the `From` header
    pub email: String,
    /// Sender display name
    pub name: String,
    /// Upgrade the connection with STARTTLS (default: false)
    pub starttls: bool,
    /// Per-send timeout (default: 10s)
    pub timeout: Duration,
}

/// Delivery retry policy and background scheduler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Attempts before a transiently failing notification is given up (default: 5)
    pub max_attempts: i32,
    /// Delay before the first retry (default: 1s)
    pub base_delay: Duration,
    /// Upper bound for any retry delay (default: 60s)
    pub max_delay: Duration,
    /// How often the scheduler scans for due records (default: 1s)
    pub poll_interval: Duration,
    /// Records processed concurrently per scan (default: 4)
    pub workers: usize,
    /// Records pulled per status per scan (default: 100)
    pub batch_size: usize,
    /// Age after which `pending`/`sending` records are considered abandoned (default: 60s)
    pub stale_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            workers: 4,
            batch_size: 100,
            stale_after: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let smtp_login = std::env::var("SMTP_LOGIN").ok().filter(|v| !v.is_empty());
        let smtp_password = std::env::var("SMTP_PASSWORD")
            .ok()
            .filter(|v| !v.is_empty());

        let config = Self {
            database_url: std::env::var("DB_URI")
                .map_err(|_| anyhow::anyhow!("DB_URI environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
            listen_addr: parse_var("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            smtp: SmtpConfig {
                host: std::env::var("SMTP_HOST")
                    .map_err(|_| anyhow::anyhow!("SMTP_HOST environment variable is required"))?,
                port: parse_var("SMTP_PORT", 25)?,
                login: smtp_login,
                password: smtp_password,
                email: std::env::var("SMTP_EMAIL")
                    .map_err(|_| anyhow::anyhow!("SMTP_EMAIL environment variable is required"))?,
                name: std::env::var("SMTP_NAME")
                    .unwrap_or_else(|_| "Notification Service".to_string()),
                starttls: parse_var("SMTP_STARTTLS", false)?,
                timeout: Duration::from_secs(parse_var("SMTP_TIMEOUT_SECS", 10)?),
            },
            dispatch: DispatchConfig {
                max_attempts: parse_var("DISPATCH_MAX_ATTEMPTS", 5)?,
                base_delay: Duration::from_millis(parse_var("DISPATCH_BASE_DELAY_MS", 1000)?),
                max_delay: Duration::from_millis(parse_var("DISPATCH_MAX_DELAY_MS", 60_000)?),
                poll_interval: Duration::from_millis(parse_var(
                    "SCHEDULER_POLL_INTERVAL_MS",
                    1000,
                )?),
                workers: parse_var("SCHEDULER_WORKERS", 4)?,
                batch_size: parse_var("SCHEDULER_BATCH_SIZE", 100)?,
                stale_after: Duration::from_secs(parse_var("SCHEDULER_STALE_AFTER_SECS", 60)?),
            },
        };

        config.dispatch.validate()?;
        if config.dispatch.stale_after <= config.smtp.timeout {
            anyhow::bail!("SCHEDULER_STALE_AFTER_SECS must exceed SMTP_TIMEOUT_SECS");
        }
        Ok(config)
    }
}

impl DispatchConfig {
    /// Reject policies the engine cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts < 1 {
            anyhow::bail!("DISPATCH_MAX_ATTEMPTS must be at least 1");
        }
        if self.base_delay > self.max_delay {
            anyhow::bail!("DISPATCH_BASE_DELAY_MS must not exceed DISPATCH_MAX_DELAY_MS");
        }
        if self.workers == 0 {
            anyhow::bail!("SCHEDULER_WORKERS must be at least 1");
        }
        if self.batch_size == 0 {
            anyhow::bail!("SCHEDULER_BATCH_SIZE must be at least 1");
        }
        Ok(())
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn parse_var<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> anyhow::Result<T> {
    raw.trim().parse().map_err(|_| {
        anyhow::anyhow!(
            "{} must be a valid {}",
            key,
            std::any::type_name::<T>()
        )
    })
}
