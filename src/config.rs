/*!
 * Configuration types for Busguard
 */

use crate::broker::NamespaceConfig;
use crate::error::{BusguardError, Result};
use crate::policy::HttpRetryPolicy;
use busguard_core_resilience::{FailbackPolicy, FailoverConfig, PoolConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "BUSGUARD_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusguardConfig {
    /// Namespace every publish goes to while healthy
    #[serde(alias = "Primary")]
    pub primary: NamespaceConfig,

    /// Standby namespace. Without one, failover is disabled.
    #[serde(alias = "Secondary", skip_serializing_if = "Option::is_none")]
    pub secondary: Option<NamespaceConfig>,

    pub pool: PoolSection,
    pub retry: RetrySection,
    pub http_retry: HttpRetrySection,
    pub failover: FailoverSection,
    pub publish: PublishSection,
    pub logging: LoggingSection,
}

/// Connection pool settings, applied to each namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    #[serde(alias = "PoolSize")]
    pub pool_size: usize,

    /// How long a replaced connection stays open for in-flight sends
    pub grace_period_secs: u64,

    /// Recycle connections older than this
    #[serde(alias = "HandlerLifetimeInMinutes", skip_serializing_if = "Option::is_none")]
    pub handler_lifetime_minutes: Option<u64>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            pool_size: 1,
            grace_period_secs: 120,
            handler_lifetime_minutes: None,
        }
    }
}

/// Retry settings for broker sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    #[serde(alias = "MaxRetries", alias = "RetryAttempts", alias = "retry_attempts")]
    pub max_retries: u32,

    pub initial_delay_ms: u64,

    pub max_delay_secs: u64,

    pub backoff_multiplier: f64,

    /// Fraction of each delay added as random jitter (0.0-1.0)
    pub jitter_factor: f64,

    /// Make exactly one attempt per target
    #[serde(alias = "IsDisabled")]
    pub is_disabled: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_secs: 30,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            is_disabled: false,
        }
    }
}

/// Classification for HTTP-style backends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRetrySection {
    /// Extra status codes to retry on top of 5xx and 408
    #[serde(alias = "RetryStatusCode")]
    pub retry_status_codes: Vec<u16>,

    /// Methods that may be retried (empty = all)
    #[serde(alias = "RetryHttpMethod")]
    pub retry_http_methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSection {
    /// Exhausted publishes within the window that trigger failover
    #[serde(alias = "ExceptionThreshold")]
    pub exception_threshold: usize,

    #[serde(alias = "SlidingDurationInSeconds")]
    pub sliding_duration_secs: u64,

    /// Return to the primary this long after a trip. Unset = stay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failback_after_secs: Option<u64>,
}

impl Default for FailoverSection {
    fn default() -> Self {
        Self {
            exception_threshold: 5,
            sliding_duration_secs: 60,
            failback_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSection {
    /// Return an error to the caller when a message ends up in the
    /// failure log, instead of a `WriteFailed` status
    pub surface_exhaustion: bool,

    /// Capacity of the in-memory failure log
    pub failure_log_capacity: usize,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            surface_exhaustion: false,
            failure_log_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// JSON output on stdout
    pub json: bool,
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

impl BusguardConfig {
    /// Load, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `BUSGUARD_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Keys are the `BUSGUARD_*`
    /// environment variable names.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(value) = get("POOL_SIZE") {
            self.pool.pool_size = parse_override("POOL_SIZE", &value)?;
        }
        if let Some(value) = get("MAX_RETRIES") {
            self.retry.max_retries = parse_override("MAX_RETRIES", &value)?;
        }
        if let Some(value) = get("RETRY_DISABLED") {
            self.retry.is_disabled = parse_override("RETRY_DISABLED", &value)?;
        }
        if let Some(value) = get("EXCEPTION_THRESHOLD") {
            self.failover.exception_threshold = parse_override("EXCEPTION_THRESHOLD", &value)?;
        }
        if let Some(value) = get("SLIDING_DURATION_SECS") {
            self.failover.sliding_duration_secs =
                parse_override("SLIDING_DURATION_SECS", &value)?;
        }
        if let Some(value) = get("LOG_LEVEL") {
            self.logging.level = match value.trim().to_ascii_lowercase().as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warn,
                "info" => LogLevel::Info,
                "debug" => LogLevel::Debug,
                "trace" => LogLevel::Trace,
                other => {
                    return Err(BusguardError::Config(format!(
                        "{}LOG_LEVEL: unknown level '{}'",
                        ENV_PREFIX, other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        check_namespace("primary", &self.primary)?;
        if let Some(secondary) = &self.secondary {
            check_namespace("secondary", secondary)?;
            if secondary.name.eq_ignore_ascii_case(&self.primary.name) {
                return Err(BusguardError::Config(
                    "secondary namespace must differ from the primary".to_string(),
                ));
            }
        }

        if self.failover.exception_threshold == 0 {
            return Err(BusguardError::Config(
                "failover.exception_threshold must be at least 1".to_string(),
            ));
        }
        if self.failover.sliding_duration_secs == 0 {
            return Err(BusguardError::Config(
                "failover.sliding_duration_secs must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(BusguardError::Config(format!(
                "retry.jitter_factor must be within 0.0-1.0, got {}",
                self.retry.jitter_factor
            )));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(BusguardError::Config(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }

        Ok(())
    }

    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool.pool_size.max(1),
            grace_period: Duration::from_secs(self.pool.grace_period_secs),
            max_lifetime: self
                .pool
                .handler_lifetime_minutes
                .map(|minutes| Duration::from_secs(minutes.saturating_mul(60))),
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter_factor: self.retry.jitter_factor,
            is_disabled: self.retry.is_disabled,
        }
    }

    pub fn to_failover_config(&self) -> FailoverConfig {
        FailoverConfig {
            exception_threshold: self.failover.exception_threshold,
            sliding_duration: Duration::from_secs(self.failover.sliding_duration_secs),
            failback: match self.failover.failback_after_secs {
                Some(secs) => FailbackPolicy::After(Duration::from_secs(secs)),
                None => FailbackPolicy::Never,
            },
        }
    }

    pub fn to_http_policy(&self) -> HttpRetryPolicy {
        HttpRetryPolicy::new(
            self.http_retry.retry_status_codes.iter().copied(),
            self.http_retry.retry_http_methods.iter(),
        )
    }
}

fn check_namespace(role: &str, namespace: &NamespaceConfig) -> Result<()> {
    if namespace.name.trim().is_empty() {
        return Err(BusguardError::Config(format!("{} namespace name is empty", role)));
    }
    if namespace.connection_string.trim().is_empty() {
        return Err(BusguardError::Config(format!(
            "{} namespace '{}' has no connection string",
            role, namespace.name
        )));
    }
    Ok(())
}

fn parse_override<T: std::str::FromStr>(suffix: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        BusguardError::Config(format!("{}{}: invalid value '{}': {}", ENV_PREFIX, suffix, value, e))
    })
}
