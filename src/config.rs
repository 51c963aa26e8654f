//! Configuration management

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub emulation: EmulationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Lab default is 2222 so the honeypot can run unprivileged; use 22 in production.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of capture sessions running at once
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// How long shutdown waits for in-flight sessions to finish
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Append-log location, also the default migration source
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of an ip-api.com compatible service; the address is appended as a path segment
    #[serde(default = "default_geoip_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_geoip_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_geoip_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmulationConfig {
    #[serde(default = "default_ssh_banner")]
    pub ssh_banner: String,
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ssh_port() -> u16 {
    2222
}

fn default_backlog() -> u32 {
    100
}

fn default_max_sessions() -> usize {
    50
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_log_path() -> PathBuf {
    PathBuf::from("data/connections.jsonl")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/connections.db")
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_persist_backoff_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_geoip_endpoint() -> String {
    "http://ip-api.com/json".to_string()
}

fn default_geoip_timeout_secs() -> u64 {
    3
}

fn default_geoip_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ssh_banner() -> String {
    "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6".to_string()
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("data/ssh_host_ed25519_key")
}

fn default_metrics_port() -> u16 {
    8000
}

fn default_refresh_interval_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ssh_port: default_ssh_port(),
            backlog: default_backlog(),
            max_sessions: default_max_sessions(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            log_path: default_log_path(),
            database_path: default_database_path(),
            persist_attempts: default_persist_attempts(),
            persist_backoff_ms: default_persist_backoff_ms(),
        }
    }
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_geoip_endpoint(),
            timeout_secs: default_geoip_timeout_secs(),
            cache_ttl_secs: default_geoip_ttl_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            ssh_banner: default_ssh_banner(),
            host_key_path: default_host_key_path(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl Config {
    /// Load `config_path` (optional on disk) layered under `HONEYPOT__SECTION__KEY` env vars.
    pub fn load(config_path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("HONEYPOT").separator("__"));

        let settings = builder
            .build()
            .with_context(|| format!("failed to read configuration from {}", config_path))?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.ssh_port == 0 {
            anyhow::bail!("Invalid ssh_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if self.server.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }
        if self.server.handshake_timeout_secs == 0 {
            anyhow::bail!("handshake_timeout_secs must be at least 1");
        }

        if self.storage.database_path.as_os_str().is_empty() {
            anyhow::bail!("Database path cannot be empty");
        }
        if self.storage.persist_attempts == 0 {
            anyhow::bail!("persist_attempts must be at least 1");
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Invalid metrics port: 0 is not allowed");
        }
        if self.metrics.refresh_interval_secs == 0 {
            anyhow::bail!("refresh_interval_secs must be at least 1");
        }

        if !self.emulation.ssh_banner.starts_with("SSH-2.0-") {
            anyhow::bail!(
                "Invalid ssh_banner '{}': must start with 'SSH-2.0-'",
                self.emulation.ssh_banner
            );
        }
        if self.emulation.ssh_banner.len() > 253 || self.emulation.ssh_banner.contains(|c| c == '\r' || c == '\n') {
            anyhow::bail!("ssh_banner must be a single line of at most 253 bytes");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.server.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    pub fn ssh_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.ssh_port)
    }

    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.metrics.port)
    }
}
