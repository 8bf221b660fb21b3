//! Server configuration.
//!
//! Defaults suit a local single-node setup. `ServerConfig::from_env` layers
//! `CODESHARE_*` environment variables on top; the binary loads a `.env`
//! file first so either source works.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `CODESHARE_BIND_ADDR` | `127.0.0.1:5000` |
//! | `CODESHARE_PERSIST_DEBOUNCE_MS` | `1000` |
//! | `CODESHARE_DEFAULT_LANGUAGE` | `javascript` |
//! | `CODESHARE_SESSION_BUFFER` | `256` |
//! | `CODESHARE_RELAY_QUEUE` | `1024` |
//! | `CODESHARE_ECHO_TO_SENDER` | `false` |
//! | `CODESHARE_STORAGE_PATH` | unset (in-memory store) |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::storage::DEFAULT_LANGUAGE;

pub const ENV_PREFIX: &str = "CODESHARE_";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Quiescence window before an edit is persisted
    pub persist_debounce: Duration,
    /// Language given to documents created without one
    pub default_language: String,
    /// Outbound frames buffered per session before drops start
    pub session_buffer: usize,
    /// Relay command queue capacity
    pub relay_queue: usize,
    /// Send content updates back to their sender too
    pub echo_to_sender: bool,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            persist_debounce: Duration::from_millis(1000),
            default_language: DEFAULT_LANGUAGE.to_string(),
            session_buffer: 256,
            relay_queue: 1024,
            echo_to_sender: false,
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Defaults overridden by `CODESHARE_*` process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each full key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(addr) = get("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(raw) = get("PERSIST_DEBOUNCE_MS") {
            config.persist_debounce = Duration::from_millis(parse("PERSIST_DEBOUNCE_MS", &raw)?);
        }
        if let Some(language) = get("DEFAULT_LANGUAGE") {
            config.default_language = language;
        }
        if let Some(raw) = get("SESSION_BUFFER") {
            config.session_buffer = parse("SESSION_BUFFER", &raw)?;
        }
        if let Some(raw) = get("RELAY_QUEUE") {
            config.relay_queue = parse("RELAY_QUEUE", &raw)?;
        }
        if let Some(raw) = get("ECHO_TO_SENDER") {
            config.echo_to_sender = parse_bool("ECHO_TO_SENDER", &raw)?;
        }
        if let Some(path) = get("STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.is_empty() {
            return Err(ConfigError::Invalid("bind address is empty".into()));
        }
        if self.persist_debounce.is_zero() {
            return Err(ConfigError::Invalid("persist debounce must be positive".into()));
        }
        if self.default_language.trim().is_empty() {
            return Err(ConfigError::Invalid("default language is empty".into()));
        }
        if self.session_buffer == 0 {
            return Err(ConfigError::Invalid("session buffer must be positive".into()));
        }
        if self.relay_queue == 0 {
            return Err(ConfigError::Invalid("relay queue must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            value: raw.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}
