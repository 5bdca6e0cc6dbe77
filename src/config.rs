// Configuration File Support
//
// TOML configuration with environment variable overrides.
// Default location: ~/.config/publish-gate/config.toml (platform config dir)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::{DispatcherConfig, HttpClientConfig, RetryConfig};
use crate::rate_limit::{LimitDefaults, DEFAULT_MAX_ACTIONS, DEFAULT_WINDOW_SECONDS};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Admin HTTP server
    pub server: ServerConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Durable state
    pub store: StoreConfig,

    /// Rate limit defaults and per-platform presets
    pub limits: LimitsConfig,

    /// Dispatch loop and retry policy
    pub dispatcher: DispatcherSection,

    /// Health thresholds and alerting
    pub slo: SloConfig,

    /// HTTP platform clients keyed by platform
    pub clients: BTreeMap<String, HttpClientConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Admin server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to expose /metrics
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend (file, memory)
    pub backend: String,

    /// Snapshot file for the file backend; defaults to the platform data dir
    pub path: Option<String>,

    /// How long usage events are kept, in hours
    pub usage_retention_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: None,
            usage_retention_hours: 8 * 24,
        }
    }
}

/// Window parameters for one platform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformLimit {
    pub window_seconds: u64,
    pub max_actions: u32,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Window length for platforms created on first use
    pub default_window_seconds: u64,

    /// Base quota for platforms created on first use
    pub default_max_actions: u32,

    /// Presets applied at startup
    pub platforms: BTreeMap<String, PlatformLimit>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_window_seconds: DEFAULT_WINDOW_SECONDS,
            default_max_actions: DEFAULT_MAX_ACTIONS,
            platforms: BTreeMap::new(),
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherSection {
    /// Failed attempts before an item is marked failed
    pub max_retries: u32,

    /// Backoff base delay in seconds
    pub backoff_base_secs: u64,

    /// Backoff cap in seconds
    pub backoff_max_secs: u64,

    /// Timeout for one publish call in seconds
    pub publish_timeout_secs: u64,

    /// Longest loop sleep in milliseconds
    pub poll_interval_ms: u64,

    /// Jitter retry delays by ±20%
    pub jitter: bool,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_secs: 15,
            backoff_max_secs: 30 * 60,
            publish_timeout_secs: 30,
            poll_interval_ms: 5000,
            jitter: false,
        }
    }
}

/// SLO configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SloConfig {
    /// Trailing window for the error rate, in minutes
    pub error_rate_window_minutes: u32,

    /// How often alerts are evaluated, in seconds
    pub alert_interval_secs: u64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            error_rate_window_minutes: 60,
            alert_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from the default config directory
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields the defaults (with env overrides applied); a file
    /// that exists but cannot be parsed or fails validation is an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "publish-gate", "PublishGate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("publish-gate")
                .join("config.toml")
        }
    }

    /// Snapshot file used by the file store
    pub fn store_path(&self) -> PathBuf {
        if let Some(path) = &self.store.path {
            return PathBuf::from(path);
        }
        match directories::ProjectDirs::from("com", "publish-gate", "PublishGate") {
            Some(proj_dirs) => proj_dirs.data_dir().join("state.json"),
            None => PathBuf::from("publish-gate-state.json"),
        }
    }

    /// Apply environment variable overrides:
    /// - PUBLISH_GATE_LOG_LEVEL
    /// - PUBLISH_GATE_LOG_FORMAT
    /// - PUBLISH_GATE_BIND
    /// - PUBLISH_GATE_STORE_BACKEND
    /// - PUBLISH_GATE_STORE_PATH
    /// - PUBLISH_GATE_MAX_RETRIES
    /// - PUBLISH_GATE_METRICS_ENABLED
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up by variable name through `var`
    fn apply_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = var("PUBLISH_GATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("PUBLISH_GATE_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(bind) = var("PUBLISH_GATE_BIND") {
            self.server.bind = bind;
        }
        if let Some(backend) = var("PUBLISH_GATE_STORE_BACKEND") {
            self.store.backend = backend;
        }
        if let Some(path) = var("PUBLISH_GATE_STORE_PATH") {
            self.store.path = Some(path);
        }
        if let Some(retries) = var("PUBLISH_GATE_MAX_RETRIES") {
            if let Ok(retries) = retries.parse::<u32>() {
                if retries > 0 {
                    self.dispatcher.max_retries = retries;
                }
            }
        }
        if let Some(enabled) = var("PUBLISH_GATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("Invalid server bind address: {}", self.server.bind);
        }

        match self.store.backend.to_lowercase().as_str() {
            "file" | "memory" => {}
            _ => anyhow::bail!(
                "Invalid store backend: {}. Must be 'file' or 'memory'",
                self.store.backend
            ),
        }
        // Must outlive the widest usage window (7 days)
        if self.store.usage_retention_hours < 7 * 24 {
            anyhow::bail!("Usage retention must be at least 168 hours");
        }

        if self.limits.default_window_seconds == 0 {
            anyhow::bail!("Default window length must be > 0");
        }
        if self.limits.default_max_actions == 0 {
            anyhow::bail!("Default max actions must be > 0");
        }
        for (platform, limit) in &self.limits.platforms {
            if platform.trim().is_empty() {
                anyhow::bail!("Rate limit preset has an empty platform name");
            }
            if limit.window_seconds == 0 || limit.max_actions == 0 {
                anyhow::bail!(
                    "Rate limit preset '{}' needs window_seconds > 0 and max_actions > 0",
                    platform
                );
            }
        }

        if self.dispatcher.max_retries == 0 {
            anyhow::bail!("Dispatcher max_retries must be > 0");
        }
        if self.dispatcher.backoff_base_secs == 0 {
            anyhow::bail!("Dispatcher backoff_base_secs must be > 0");
        }
        if self.dispatcher.backoff_max_secs < self.dispatcher.backoff_base_secs {
            anyhow::bail!("Dispatcher backoff_max_secs must be >= backoff_base_secs");
        }
        if self.dispatcher.publish_timeout_secs == 0 {
            anyhow::bail!("Dispatcher publish_timeout_secs must be > 0");
        }
        if self.dispatcher.poll_interval_ms == 0 {
            anyhow::bail!("Dispatcher poll_interval_ms must be > 0");
        }

        if self.slo.error_rate_window_minutes == 0 {
            anyhow::bail!("SLO error_rate_window_minutes must be > 0");
        }
        if self.slo.alert_interval_secs == 0 {
            anyhow::bail!("SLO alert_interval_secs must be > 0");
        }

        for (platform, client) in &self.clients {
            if client.endpoint.is_empty() {
                anyhow::bail!("Client '{}' has empty endpoint", platform);
            }
            if !client.endpoint.starts_with("http://") && !client.endpoint.starts_with("https://") {
                anyhow::bail!(
                    "Client '{}' endpoint must be an http(s) URL: {}",
                    platform,
                    client.endpoint
                );
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Defaults for lazily created rate limit windows
    pub fn limit_defaults(&self) -> LimitDefaults {
        LimitDefaults {
            window_seconds: self.limits.default_window_seconds,
            max_actions: self.limits.default_max_actions,
        }
    }

    /// Dispatcher settings in runtime form
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let d = &self.dispatcher;
        DispatcherConfig {
            retry: RetryConfig {
                max_retries: d.max_retries,
                backoff_base: Duration::from_secs(d.backoff_base_secs),
                backoff_max: Duration::from_secs(d.backoff_max_secs),
                jitter: d.jitter,
            },
            publish_timeout: Duration::from_secs(d.publish_timeout_secs),
            poll_interval: Duration::from_millis(d.poll_interval_ms),
        }
    }

    /// Usage retention horizon
    pub fn usage_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.store.usage_retention_hours as i64)
    }
}
