//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty or
//! missing file yields a working daemon.
//!
//! ```toml
//! [daemon]
//! socket_path = "/tmp/courier.sock"
//!
//! [units]
//! directory = "/var/lib/courier/units"
//! default_unit = "ping"
//!
//! [engine]
//! pacing_ms = 300
//! # Optional; requests above the limit are rejected.
//! max_iterations = 1000
//!
//! [reconnect]
//! max_attempts = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::{DEFAULT_DIRECT_SUFFIX, DEFAULT_ITERATIONS};

use crate::server::DEFAULT_SOCKET_PATH;

/// Environment variable overriding `[daemon] socket_path`.
pub const SOCKET_ENV: &str = "COURIER_SOCKET";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub daemon: DaemonConfig,
    pub units: UnitsConfig,
    pub engine: EngineConfig,
    pub reconnect: ReconnectConfig,
    pub pairing: PairingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitsConfig {
    /// Directory holding persistent unit manifests.
    pub directory: PathBuf,

    /// Unit used when a requested name resolves to nothing.
    pub default_unit: Option<String>,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            directory: default_units_dir(),
            default_unit: None,
        }
    }
}

fn default_units_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("courier")
        .join("units")
}

/// Dispatch loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause between iterations.
    pub pacing_ms: u64,
    pub default_iterations: u32,
    /// Largest accepted iteration count. Unlimited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Appended to bare numeric targets.
    pub direct_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pacing_ms: 300,
            default_iterations: DEFAULT_ITERATIONS,
            max_iterations: None,
            direct_suffix: DEFAULT_DIRECT_SUFFIX.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

/// Exponential backoff for non-terminal connection closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Consecutive failed attempts before the session is marked degraded.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Pairing-code handshake timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Wait before the first attempt, giving the transport time to settle.
    pub initial_delay_ms: u64,
    /// Wait between attempts while the transport is not ready.
    pub poll_interval_ms: u64,
    /// Wait after a generic failure.
    pub retry_interval_ms: u64,
    /// Wait after purging credentials on an unauthorized response.
    pub purge_retry_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 6_000,
            poll_interval_ms: 3_000,
            retry_interval_ms: 4_000,
            purge_retry_delay_ms: 2_000,
            max_attempts: 8,
        }
    }
}

impl PairingConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn purge_retry_delay(&self) -> Duration {
        Duration::from_millis(self.purge_retry_delay_ms)
    }
}

impl CourierConfig {
    /// Default config file location (`$XDG_CONFIG_HOME/courier/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("courier").join("config.toml"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Loads the effective configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used when present and built-in defaults otherwise. `COURIER_SOCKET`
    /// is applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        if let Some(socket) = std::env::var_os(SOCKET_ENV) {
            config.daemon.socket_path = PathBuf::from(socket);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.default_iterations == 0 {
            return Err(ConfigError::Invalid(
                "engine.default_iterations must be at least 1".into(),
            ));
        }
        if self.engine.max_iterations == Some(0) {
            return Err(ConfigError::Invalid(
                "engine.max_iterations must be at least 1".into(),
            ));
        }
        if self.engine.direct_suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "engine.direct_suffix must not be empty".into(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect.multiplier must be >= 1.0 (got {})",
                self.reconnect.multiplier
            )));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        if self.pairing.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "pairing.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
