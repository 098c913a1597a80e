#![deny(unsafe_code)]

//! Configuration loading and validation for loopbridge.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure
//! shared by the daemon and the CLI.

use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

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
    /// Daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Loopback address pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Hosts file configuration.
    #[serde(default)]
    pub hosts: HostsConfig,

    /// Bounded waits for OS operations.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the daemon process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path of the Unix domain socket the daemon binds.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> String {
    "/tmp/loopbridge.sock".to_string()
}

/// Loopback address pool configuration.
///
/// Addresses for redirected endpoints are drawn from this CIDR. The range
/// must be inside 127.0.0.0/8 so allocated aliases never route off-host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// CIDR the allocator scans, e.g. "127.1.1.0/24".
    #[serde(default = "default_pool_cidr")]
    pub cidr: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cidr: default_pool_cidr(),
        }
    }
}

fn default_pool_cidr() -> String {
    "127.1.1.0/24".to_string()
}

/// Hosts file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostsConfig {
    /// Path of the hosts file the daemon edits.
    #[serde(default = "default_hosts_path")]
    pub path: String,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            path: default_hosts_path(),
        }
    }
}

fn default_hosts_path() -> String {
    "/etc/hosts".to_string()
}

/// Bounded waits for OS operations.
///
/// Exceeding a bound is reported as a per-item failure, never a hang.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds to wait for a terminated process to exit before escalating.
    #[serde(default = "default_process_exit_secs")]
    pub process_exit_secs: u64,

    /// Seconds to wait for a stopped service to report inactive.
    #[serde(default = "default_service_stop_secs")]
    pub service_stop_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            process_exit_secs: default_process_exit_secs(),
            service_stop_secs: default_service_stop_secs(),
        }
    }
}

fn default_process_exit_secs() -> u64 {
    5
}

fn default_service_stop_secs() -> u64 {
    30
}

impl TimeoutConfig {
    /// Bounded wait for process exit as a [`Duration`].
    pub fn process_exit(&self) -> Duration {
        Duration::from_secs(self.process_exit_secs)
    }

    /// Bounded wait for service stop as a [`Duration`].
    pub fn service_stop(&self) -> Duration {
        Duration::from_secs(self.service_stop_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rotating log files. None disables file logging.
    /// The invoking process usually supplies this via `--log-dir`.
    #[serde(default)]
    pub dir: Option<String>,

    /// Seconds between log file rotations.
    #[serde(default = "default_rotate_secs")]
    pub rotate_secs: u64,

    /// Seconds between forced flushes of the active log file.
    #[serde(default = "default_flush_secs")]
    pub flush_secs: u64,

    /// Number of rotated files to retain per process.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            rotate_secs: default_rotate_secs(),
            flush_secs: default_flush_secs(),
            max_files: default_max_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotate_secs() -> u64 {
    3600
}

fn default_flush_secs() -> u64 {
    5
}

fn default_max_files() -> usize {
    8
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.socket_path.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.socket_path must not be empty".to_string(),
            ));
        }

        let net = self.pool_net()?;
        if !net.addr().is_loopback() {
            return Err(ConfigError::Validation(format!(
                "pool.cidr must be inside 127.0.0.0/8, got {:?}",
                self.pool.cidr
            )));
        }

        if self.hosts.path.is_empty() {
            return Err(ConfigError::Validation(
                "hosts.path must not be empty".to_string(),
            ));
        }

        if self.timeouts.process_exit_secs == 0 {
            return Err(ConfigError::Validation(
                "timeouts.process_exit_secs must be non-zero".to_string(),
            ));
        }
        if self.timeouts.service_stop_secs == 0 {
            return Err(ConfigError::Validation(
                "timeouts.service_stop_secs must be non-zero".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }
        if self.logging.rotate_secs == 0 {
            return Err(ConfigError::Validation(
                "logging.rotate_secs must be non-zero".to_string(),
            ));
        }
        if self.logging.flush_secs == 0 {
            return Err(ConfigError::Validation(
                "logging.flush_secs must be non-zero".to_string(),
            ));
        }
        if self.logging.max_files == 0 {
            return Err(ConfigError::Validation(
                "logging.max_files must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The loopback pool as a parsed network.
    pub fn pool_net(&self) -> Result<Ipv4Net, ConfigError> {
        self.pool.cidr.parse::<Ipv4Net>().map_err(|e| {
            ConfigError::Validation(format!("pool.cidr is not a valid CIDR: {e}"))
        })
    }
}
