//! Runtime configuration.
//!
//! [`CoreConfig`] can be built from defaults, from a JSON document, or from
//! `GROVE_*` environment variables. Missing fields fall back to defaults and
//! [`CoreConfig::validate`] rejects values the core cannot run safely with.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum PBKDF2 iteration count accepted for vault key derivation.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Relay used when no relays are configured.
pub const DEFAULT_RELAY: &str = "wss://grove-relay.onrender.com";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is present but not acceptable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A value could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Configuration for the vault, relay connections and event cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// PBKDF2-HMAC-SHA256 iterations for vault key derivation.
    pub kdf_iterations: u32,

    /// Seconds to wait for a relay link to open.
    pub connect_timeout_secs: u64,

    /// `SQLite` file for cached events and vault records; in-memory when `None`.
    pub database_path: Option<PathBuf>,

    /// Relays the connection manager opens by default.
    pub default_relays: Vec<String>,

    /// Capacity of each connection's status broadcast channel.
    pub event_channel_capacity: usize,

    /// `tracing` filter directive used by [`crate::logging::init`].
    pub log_filter: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
            connect_timeout_secs: 10,
            database_path: None,
            default_relays: vec![DEFAULT_RELAY.to_string()],
            event_channel_capacity: 64,
            log_filter: "info".to_string(),
        }
    }
}

impl CoreConfig {
    /// Parses a JSON document, filling missing fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] if the result fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `GROVE_*` environment variables on top of the defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `GROVE_KDF_ITERATIONS` | `kdf_iterations` |
    /// | `GROVE_CONNECT_TIMEOUT_SECS` | `connect_timeout_secs` |
    /// | `GROVE_DATABASE_PATH` | `database_path` |
    /// | `GROVE_DEFAULT_RELAYS` | `default_relays` (comma-separated) |
    /// | `GROVE_LOG` | `log_filter` |
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_var("GROVE_KDF_ITERATIONS") {
            config.kdf_iterations = parse_number("GROVE_KDF_ITERATIONS", &value)?;
        }
        if let Some(value) = env_var("GROVE_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout_secs = parse_number("GROVE_CONNECT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = env_var("GROVE_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env_var("GROVE_DEFAULT_RELAYS") {
            config.default_relays = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = env_var("GROVE_LOG") {
            config.log_filter = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(ConfigError::Invalid(format!(
                "kdf_iterations must be at least {MIN_KDF_ITERATIONS}, got {}",
                self.kdf_iterations
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        for relay in &self.default_relays {
            crate::relay::validate_relay_url(relay)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{name}: {e}")))
}
