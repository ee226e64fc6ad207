/*!
 * Configuration for a Tether client
 *
 * Every section is optional in TOML; missing fields take the defaults below.
 * Durations are whole milliseconds.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_connect::{HealthCheckConfig, ManagerConfig};
use tether_core_resilience::{BackoffPolicy, CircuitBreakerConfig, PoolConfig, RateLimiterConfig, RetryConfig};

use crate::error::{Result, TetherError};

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TetherConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub health_check: HealthCheckSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub rate_limiter: RateLimiterSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the client holds its connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// One managed connection, optionally health checked
    #[default]
    Single,
    /// A bounded pool of connections
    Pool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Address of the remote service
    #[serde(default)]
    pub target: String,

    #[serde(default)]
    pub mode: ConnectionMode,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// Per-call deadline applied on top of the caller's context (0 = none)
    #[serde(default)]
    pub request_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            target: String::new(),
            mode: ConnectionMode::Single,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            request_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_initial_size")]
    pub initial_size: usize,

    #[serde(default = "default_max_size")]
    pub max_size: usize,

    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_true")]
    pub enable_health_check: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            initial_size: default_initial_size(),
            max_size: default_max_size(),
            min_idle: default_min_idle(),
            max_idle_ms: default_max_idle_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            health_check_interval_ms: default_health_interval_ms(),
            enable_health_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    #[serde(default = "default_max_burst")]
    pub max_burst: f64,

    /// How long a call may wait for a token (0 = fail immediately)
    #[serde(default)]
    pub wait_timeout_ms: u64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: default_requests_per_second(),
            max_burst: default_max_burst(),
            wait_timeout_ms: 0,
        }
    }
}

/// Delay schedule between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `retry_delay_ms` before every retry
    Fixed,
    /// `backoff_base_ms * backoff_factor^attempt`, capped at `max_backoff_ms`
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt (0 = no retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffKind,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on a single backoff delay (0 = unbounded)
    #[serde(default)]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: BackoffKind::Exponential,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: 0,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

impl LoggingConfig {
    /// Effective level after applying `verbose`
    pub fn effective_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else {
            self.level.to_tracing_level()
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_timeout_ms() -> u64 {
    10_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_initial_size() -> usize {
    2
}

fn default_max_size() -> usize {
    10
}

fn default_min_idle() -> usize {
    1
}

fn default_max_idle_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_acquire_timeout_ms() -> u64 {
    3_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    10_000
}

fn default_half_open_max_requests() -> u32 {
    1
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_max_burst() -> f64 {
    20.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl TetherConfig {
    /// Default configuration for `target`
    pub fn for_target(target: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.connection.target = target.into();
        config
    }

    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TetherConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = self.to_toml_string()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TetherError::Config(format!("Failed to serialize configuration: {}", e)))
    }

    /// Reject settings no component could run with
    pub fn validate(&self) -> Result<()> {
        if self.connection.target.trim().is_empty() {
            return Err(TetherError::Config("connection.target must not be empty".to_string()));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(TetherError::Config(
                "connection.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.pool.max_size == 0 {
            return Err(TetherError::Config("pool.max_size must be at least 1".to_string()));
        }
        if self.pool.initial_size > self.pool.max_size || self.pool.min_idle > self.pool.max_size {
            return Err(TetherError::Config(format!(
                "pool.initial_size ({}) and pool.min_idle ({}) must not exceed pool.max_size ({})",
                self.pool.initial_size, self.pool.min_idle, self.pool.max_size
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(TetherError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        let rate = self.rate_limiter.requests_per_second;
        if self.rate_limiter.enabled && (rate.is_nan() || rate <= 0.0) {
            return Err(TetherError::Config(
                "rate_limiter.requests_per_second must be greater than 0".to_string(),
            ));
        }
        let factor = self.retry.backoff_factor;
        if self.retry.backoff == BackoffKind::Exponential && (factor.is_nan() || factor < 1.0) {
            return Err(TetherError::Config("retry.backoff_factor must be at least 1.0".to_string()));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            target: self.connection.target.clone(),
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            reconnect_timeout: Duration::from_millis(self.connection.reconnect_timeout_ms),
            health_check: HealthCheckConfig {
                enabled: self.health_check.enabled,
                interval: Duration::from_millis(self.health_check.interval_ms),
            },
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            initial_size: self.pool.initial_size,
            max_size: self.pool.max_size,
            min_idle: self.pool.min_idle,
            max_idle: Duration::from_millis(self.pool.max_idle_ms),
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            health_check_interval: Duration::from_millis(self.pool.health_check_interval_ms),
            enable_health_check: self.pool.enable_health_check,
        }
    }

    /// Breaker settings, or `None` when the breaker is disabled
    pub fn circuit_breaker_config(&self) -> Option<CircuitBreakerConfig> {
        let settings = &self.circuit_breaker;
        settings.enabled.then(|| CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
            half_open_max_requests: settings.half_open_max_requests,
        })
    }

    /// Limiter settings, or `None` when rate limiting is disabled
    pub fn rate_limiter_config(&self) -> Option<RateLimiterConfig> {
        let settings = &self.rate_limiter;
        settings.enabled.then(|| RateLimiterConfig {
            requests_per_second: settings.requests_per_second,
            max_burst: settings.max_burst,
            wait_timeout: Duration::from_millis(settings.wait_timeout_ms),
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        let settings = &self.retry;
        let policy = match settings.backoff {
            BackoffKind::Fixed => BackoffPolicy::Fixed(Duration::from_millis(settings.retry_delay_ms)),
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                base: Duration::from_millis(settings.backoff_base_ms),
                factor: settings.backoff_factor,
                max: (settings.max_backoff_ms > 0).then(|| Duration::from_millis(settings.max_backoff_ms)),
            },
        };

        RetryConfig {
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            policy: Some(policy),
        }
    }

    /// Per-call deadline, if configured
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.connection.request_timeout_ms > 0).then(|| Duration::from_millis(self.connection.request_timeout_ms))
    }
}
