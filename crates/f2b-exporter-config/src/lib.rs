#![deny(unsafe_code)]

//! Configuration loading and validation for the fail2ban exporter.
//!
//! Loads TOML configuration files and validates them. [`AppConfig`] is
//! built once at startup and handed to the protocol client, the metrics
//! collector and the HTTP server; nothing reads configuration from
//! process-wide state.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default path of the fail2ban server socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/fail2ban/fail2ban.sock";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// fail2ban socket and framing settings.
    #[serde(default)]
    pub socket: SocketConfig,

    /// Reconnect backoff settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// HTTP listener settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the fail2ban server listens and how responses are framed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Filesystem path of the fail2ban Unix socket.
    #[serde(default = "default_socket_path")]
    pub path: String,

    /// How the end-of-command sentinel is searched for while reading:
    /// "accumulated" scans everything read so far, "per-chunk" only scans
    /// the most recent read.
    #[serde(default = "default_sentinel_scan")]
    pub sentinel_scan: String,

    /// Upper bound for one command/response exchange, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            sentinel_scan: default_sentinel_scan(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl SocketConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_sentinel_scan() -> String {
    "accumulated".to_string()
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

/// Exponential backoff applied while redialing the fail2ban socket.
///
/// ## TOML Example
///
/// ```toml
/// [reconnect]
/// initial_interval_ms = 100
/// multiplier = 2.0
/// max_interval_ms = 10000
/// max_attempts = 20
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the second dial attempt.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Factor applied to the delay after every failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Cap on the delay between two attempts.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Give up after this many attempts. Unset means retry forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Upper bound for a single connect call.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// How long a request waits for an in-flight reconnect before
    /// reporting the daemon as unavailable.
    #[serde(default = "default_connect_wait_ms")]
    pub connect_wait_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            max_attempts: None,
            dial_timeout_ms: default_dial_timeout_ms(),
            connect_wait_ms: default_connect_wait_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }
}

fn default_initial_interval_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    10_000
}

fn default_dial_timeout_ms() -> u64 {
    2_000
}

fn default_connect_wait_ms() -> u64 {
    3_000
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address on which to expose metrics and the landing page.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Path under which to expose metrics.
    #[serde(default = "default_telemetry_path")]
    pub telemetry_path: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            telemetry_path: default_telemetry_path(),
        }
    }
}

impl WebConfig {
    /// Parse the listen address. A bare `:port` binds every interface.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        };
        addr.parse().map_err(|e| {
            ConfigError::Validation(format!(
                "web.listen_address {:?} is not a socket address: {e}",
                self.listen_address
            ))
        })
    }
}

fn default_listen_address() -> String {
    ":9539".to_string()
}

/// Routes served besides the telemetry path.
const RESERVED_PATHS: [&str; 2] = ["/", "/health"];

fn default_telemetry_path() -> String {
    "/metrics".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket.path.is_empty() {
            return Err(ConfigError::Validation(
                "socket.path must not be empty".to_string(),
            ));
        }
        let valid_scans = ["accumulated", "per-chunk"];
        if !valid_scans.contains(&self.socket.sentinel_scan.as_str()) {
            return Err(ConfigError::Validation(format!(
                "socket.sentinel_scan must be one of {:?}, got {:?}",
                valid_scans, self.socket.sentinel_scan
            )));
        }
        if self.socket.read_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "socket.read_timeout_ms must be non-zero".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "reconnect.initial_interval_ms must be non-zero".to_string(),
            ));
        }
        if reconnect.multiplier.is_nan() || reconnect.multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "reconnect.multiplier must be at least 1.0, got {}",
                reconnect.multiplier
            )));
        }
        if reconnect.max_interval_ms < reconnect.initial_interval_ms {
            return Err(ConfigError::Validation(format!(
                "reconnect.max_interval_ms ({}) must not be below initial_interval_ms ({})",
                reconnect.max_interval_ms, reconnect.initial_interval_ms
            )));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(ConfigError::Validation(
                "reconnect.max_attempts must be at least 1 when set".to_string(),
            ));
        }
        if reconnect.dial_timeout_ms == 0 || reconnect.connect_wait_ms == 0 {
            return Err(ConfigError::Validation(
                "reconnect.dial_timeout_ms and reconnect.connect_wait_ms must be non-zero"
                    .to_string(),
            ));
        }

        self.web.socket_addr()?;
        let path = self.web.telemetry_path.as_str();
        if !path.starts_with('/') || RESERVED_PATHS.contains(&path) {
            return Err(ConfigError::Validation(format!(
                "web.telemetry_path must be an absolute path other than {RESERVED_PATHS:?}, got {path:?}"
            )));
        }
        if path.contains(['{', '}']) {
            return Err(ConfigError::Validation(format!(
                "web.telemetry_path must be a literal path, got {path:?}"
            )));
        }

        Ok(())
    }
}
