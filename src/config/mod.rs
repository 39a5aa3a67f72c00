//! Configuration Module
//!
//! Provides TOML-based configuration for PerchMQ with support for:
//! - Server settings (bind address, listen backlog)
//! - Connection limits
//! - Handshake retry budgets
//! - Collector and topic tree housekeeping
//! - Environment variable overrides (PERCHMQ__* prefix)

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, DEFAULT_PORT};
use crate::session::RetryPolicy;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// CONN and DISC handshake budgets
    pub handshake: HandshakeConfig,
    /// Connection collector
    pub collector: CollectorConfig,
    /// Topic tree housekeeping
    pub topics: TopicsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}
fn default_backlog() -> u32 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            backlog: default_backlog(),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-connection outbound frame queue. Deliveries to a connection whose
    /// queue is full are dropped.
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
}

fn default_max_connections() -> usize {
    128
}
fn default_outbound_channel_capacity() -> usize {
    1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
        }
    }
}

/// Handshake retry budgets
///
/// Each step is tried at most `*_retries` times, each try waiting at most
/// `*_interval` (e.g. "100ms").
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    #[serde(default = "default_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub connect_interval: Duration,
    #[serde(default = "default_retries")]
    pub disconnect_retries: u32,
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub disconnect_interval: Duration,
}

fn default_retries() -> u32 {
    10
}
fn default_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            connect_retries: default_retries(),
            connect_interval: default_interval(),
            disconnect_retries: default_retries(),
            disconnect_interval: default_interval(),
        }
    }
}

impl HandshakeConfig {
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_retries, self.connect_interval)
    }

    pub fn disconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.disconnect_retries, self.disconnect_interval)
    }
}

/// Collector configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Sweep interval in addition to wake-ups from closing connections
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

/// Topic tree configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Remove topics with no subscribers, retained message or children
    /// after connections are reclaimed. Topics are kept forever otherwise.
    pub prune_empty: bool,
}

impl Config {
    /// Load configuration from a TOML file with environment variable support.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `PERCHMQ__` prefix with double underscores for nesting:
    ///    - `PERCHMQ__SERVER__BIND=0.0.0.0:42070` overrides `server.bind`
    ///    - `PERCHMQ__LIMITS__MAX_CONNECTIONS=256` overrides `limits.max_connections`
    ///    - `PERCHMQ__HANDSHAKE__CONNECT_INTERVAL=250ms` overrides `handshake.connect_interval`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", default_bind().to_string())?
            .set_default("server.backlog", default_backlog())?
            .set_default("limits.max_connections", default_max_connections() as u64)?
            .set_default(
                "limits.outbound_channel_capacity",
                default_outbound_channel_capacity() as u64,
            )?
            .set_default("handshake.connect_retries", default_retries())?
            .set_default("handshake.connect_interval", "100ms")?
            .set_default("handshake.disconnect_retries", default_retries())?
            .set_default("handshake.disconnect_interval", "100ms")?
            .set_default("collector.interval", "100ms")?
            .set_default("topics.prune_empty", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("PERCHMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "log.level must be one of {}, got '{}'",
                LEVELS.join(", "),
                self.log.level
            )));
        }

        if self.limits.max_connections == 0 {
            return Err(ConfigError::Validation(
                "limits.max_connections must be at least 1".to_string(),
            ));
        }
        if self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "limits.outbound_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.server.backlog == 0 {
            return Err(ConfigError::Validation(
                "server.backlog must be at least 1".to_string(),
            ));
        }

        let h = &self.handshake;
        if h.connect_retries == 0 || h.disconnect_retries == 0 {
            return Err(ConfigError::Validation(
                "handshake retries must be at least 1".to_string(),
            ));
        }
        if h.connect_interval.is_zero() || h.disconnect_interval.is_zero() {
            return Err(ConfigError::Validation(
                "handshake intervals must be non-zero".to_string(),
            ));
        }
        if self.collector.interval.is_zero() {
            return Err(ConfigError::Validation(
                "collector.interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Broker settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            backlog: self.server.backlog,
            max_connections: self.limits.max_connections,
            outbound_channel_capacity: self.limits.outbound_channel_capacity,
            connect_policy: self.handshake.connect_policy(),
            disconnect_policy: self.handshake.disconnect_policy(),
            collector_interval: self.collector.interval,
            prune_empty_topics: self.topics.prune_empty,
        }
    }
}
