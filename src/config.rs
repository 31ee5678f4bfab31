use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::enums::ApprovalPolicy;

/// Application-level constants
pub const APP_NAME: &str = "lis";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Database file name inside the data directory.
pub const DATABASE_FILE: &str = "lis.db";

const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_AUDIT_RETENTION_DAYS: i64 = 90;

/// Get the application data directory: `<platform data dir>/lis`, or `./lis`
/// when the platform reports none.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Tracing filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "lis_lib=debug,tower_http=debug,info"
    } else {
        "lis_lib=info,tower_http=warn,warn"
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings for the server, read from `LIS_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Upper bound on waiting for an order lock or the SQLite write lock.
    pub store_timeout: Duration,
    /// Upper bound on a whole API request's store work.
    pub request_timeout: Duration,
    pub approval_policy: ApprovalPolicy,
    pub audit_retention_days: i64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    ///
    /// The request timeout must exceed twice the store timeout, so a request
    /// that waits out the order lock and then the SQLite lock still answers
    /// with the store's own timeout error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            data_dir: lookup("LIS_DATA_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            bind_addr: parse_var(&lookup, "LIS_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            store_timeout: parse_var::<u64>(&lookup, "LIS_STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            request_timeout: parse_var::<u64>(&lookup, "LIS_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            approval_policy: parse_var(&lookup, "LIS_APPROVAL_POLICY")?
                .unwrap_or(defaults.approval_policy),
            audit_retention_days: parse_var(&lookup, "LIS_AUDIT_RETENTION_DAYS")?
                .unwrap_or(defaults.audit_retention_days),
        };

        if config.request_timeout <= config.store_timeout * 2 {
            return Err(ConfigError::Invalid {
                key: "LIS_REQUEST_TIMEOUT_MS",
                value: config.request_timeout.as_millis().to_string(),
                reason: format!(
                    "must be greater than twice the store timeout ({} ms)",
                    config.store_timeout.as_millis()
                ),
            });
        }
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: app_data_dir(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            approval_policy: ApprovalPolicy::Distinct,
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
    }
}
