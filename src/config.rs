use crate::admission::{RetryAfterPolicy, DEFAULT_WINDOW};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_BIND: &str = "0.0.0.0:3001";
const DEFAULT_MANAGEMENT_BIND: &str = "0.0.0.0:3002";
const DEFAULT_DB_PATH: &str = "data/bobs_corn.sqlite";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid bind address for {variable}: {value}")]
    InvalidBindAddress { variable: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub api_addr: SocketAddr,
    pub management_addr: SocketAddr,
    pub db_path: PathBuf,
    pub window: Duration,
    pub retry_after: RetryAfterPolicy,
    pub cors_permissive: bool,
    pub request_logging: bool,
    pub busy_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_addr: parse_default(DEFAULT_API_BIND),
            management_addr: parse_default(DEFAULT_MANAGEMENT_BIND),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            window: DEFAULT_WINDOW,
            retry_after: RetryAfterPolicy::default(),
            cors_permissive: true,
            request_logging: false,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            log_format: LogFormat::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source. Blank
    /// values count as unset; unparseable numbers and flags fall back to the
    /// defaults, unparseable bind addresses are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let api_addr = match (get("CORN_BIND"), get("PORT")) {
            (Some(bind), _) => parse_addr("CORN_BIND", &bind)?,
            (None, Some(port)) => parse_addr("PORT", &format!("0.0.0.0:{}", port.trim()))?,
            (None, None) => defaults.api_addr,
        };
        let management_addr = match get("MANAGEMENT_BIND") {
            Some(bind) => parse_addr("MANAGEMENT_BIND", &bind)?,
            None => defaults.management_addr,
        };

        Ok(Self {
            api_addr,
            management_addr,
            db_path: get("CORN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            window: Duration::from_secs(normalize(
                get("CORN_WINDOW_SECONDS").and_then(|v| v.trim().parse().ok()),
                defaults.window.as_secs(),
            )),
            retry_after: get("CORN_RETRY_AFTER")
                .and_then(|v| RetryAfterPolicy::parse(&v))
                .unwrap_or(defaults.retry_after),
            cors_permissive: get("CORN_CORS_PERMISSIVE")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.cors_permissive),
            request_logging: get("CORN_REQUEST_LOGGING")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.request_logging),
            busy_timeout: Duration::from_millis(normalize(
                get("CORN_BUSY_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()),
                DEFAULT_BUSY_TIMEOUT_MS,
            )),
            log_format: match get("CORN_LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
                Some(format) if format == "json" => LogFormat::Json,
                _ => LogFormat::Text,
            },
        })
    }
}

fn normalize(value: Option<u64>, default_value: u64) -> u64 {
    match value {
        Some(v) if v > 0 => v,
        _ => default_value,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_addr(variable: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidBindAddress {
            variable,
            value: value.to_string(),
        })
}

fn parse_default(value: &str) -> SocketAddr {
    value
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}
