//! Configuration management for Tollgate.
//!
//! Sources are layered, later ones winning:
//!
//! 1. built-in defaults
//! 2. an optional YAML file
//! 3. `TOLLGATE__<SECTION>__<KEY>` environment variables
//! 4. the conventional `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD` and
//!    `REDIS_DB` variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimitPolicy;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Store health monitoring
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Path to a YAML rate limit policy; the built-in table is used when unset
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Account admission-layer requests by the first `X-Forwarded-For` hop
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local map; counters are not shared between instances
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_store_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// Connection attempts after the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Longest pause between connection attempts, in milliseconds
    #[serde(default = "default_backoff_cap")]
    pub retry_backoff_cap_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: default_store_host(),
            port: default_store_port(),
            password: None,
            db: 0,
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_cap_ms: default_backoff_cap(),
        }
    }
}

impl StoreConfig {
    /// Redis connection URL built from host, port, password and database.
    pub fn connection_url(&self) -> String {
        let auth = match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(":{}@", password),
            _ => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    6379
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_response_timeout() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_cap() -> u64 {
    1_000
}

/// Store health monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval in seconds; 0 disables the monitor
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(TollgateError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("store.host", std::env::var("REDIS_HOST").ok())?
            .set_override_option("store.port", std::env::var("REDIS_PORT").ok())?
            .set_override_option("store.password", std::env::var("REDIS_PASSWORD").ok())?
            .set_override_option("store.db", std::env::var("REDIS_DB").ok())?
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// The rate limit policy this configuration points at.
    pub fn policy(&self) -> Result<RateLimitPolicy> {
        match &self.policy_path {
            Some(path) => RateLimitPolicy::from_file(path),
            None => Ok(RateLimitPolicy::canonical()),
        }
    }
}
