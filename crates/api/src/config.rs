//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use ledger::LedgerConfig;
use ledger_store::RetryPolicy;
use transfer::TransferConfig;

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `DATABASE_URL`: PostgreSQL URL; unset means the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `REQUEST_TIMEOUT_MS`: per-request bound on ledger calls (default: `5000`)
/// - `TRANSFER_TTL_HOURS`: claim window (default: `72`)
/// - `TRANSFER_RATE_LIMIT_MAX` / `TRANSFER_RATE_LIMIT_WINDOW_SECS`:
///   transfers per owner per window (default: `10` per `3600`)
/// - `RECONCILE_INTERVAL_SECS`: scheduler period, `0` disables it (default: `86400`)
/// - `RECONCILE_BATCH_SIZE`: summary rows per write (default: `400`)
/// - `TX_MAX_ATTEMPTS`: transaction attempts on conflict (default: `5`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub request_timeout: Duration,
    pub transfer_ttl_hours: i64,
    pub transfer_rate_limit_max: u32,
    pub transfer_rate_limit_window_secs: u64,
    pub reconcile_interval: Duration,
    pub reconcile_batch_size: usize,
    pub tx_max_attempts: u32,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Values that fail to parse are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: env_or("LOG_FORMAT", defaults.log_format),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            database_max_connections: env_or(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            request_timeout: Duration::from_millis(env_or("REQUEST_TIMEOUT_MS", 5000)),
            transfer_ttl_hours: env_or("TRANSFER_TTL_HOURS", defaults.transfer_ttl_hours),
            transfer_rate_limit_max: env_or(
                "TRANSFER_RATE_LIMIT_MAX",
                defaults.transfer_rate_limit_max,
            ),
            transfer_rate_limit_window_secs: env_or(
                "TRANSFER_RATE_LIMIT_WINDOW_SECS",
                defaults.transfer_rate_limit_window_secs,
            ),
            reconcile_interval: Duration::from_secs(env_or(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval.as_secs(),
            )),
            reconcile_batch_size: env_or("RECONCILE_BATCH_SIZE", defaults.reconcile_batch_size),
            tx_max_attempts: env_or("TX_MAX_ATTEMPTS", defaults.tx_max_attempts),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.tx_max_attempts)
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            retry: self.retry_policy(),
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            ttl: chrono::Duration::hours(self.transfer_ttl_hours),
            rate_limit_max: self.transfer_rate_limit_max,
            rate_limit_window_secs: self.transfer_rate_limit_window_secs,
            retry: self.retry_policy(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            database_max_connections: 10,
            request_timeout: Duration::from_secs(5),
            transfer_ttl_hours: 72,
            transfer_rate_limit_max: 10,
            transfer_rate_limit_window_secs: 3600,
            reconcile_interval: Duration::from_secs(86_400),
            reconcile_batch_size: 400,
            tx_max_attempts: 5,
        }
    }
}
