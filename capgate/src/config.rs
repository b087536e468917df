//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: CAPGATE_, sections split on `__`)
//! 2. An explicit TOML file, when one is given
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Bridge debounce configuration
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Per-endpoint rate limiting configuration
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// Per-endpoint circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Request queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Audit log configuration
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Bridge companion debounce configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How long an offline report must persist before it takes effect.
    /// Recovery to online is immediate.
    #[serde(default = "default_bridge_stable_ms")]
    pub stable_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stable_ms: default_bridge_stable_ms(),
        }
    }
}

impl BridgeConfig {
    /// Offline debounce as a Duration
    pub fn stable(&self) -> Duration {
        Duration::from_millis(self.stable_ms)
    }
}

/// Fixed-window rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Window length in milliseconds
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,

    /// Admitted requests per window per endpoint
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            max_requests: default_rate_max_requests(),
        }
    }
}

impl RateLimiterConfig {
    /// Window length as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Counted failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Wait before an open circuit admits a probe, in milliseconds
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Open-to-probe wait as a Duration
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Response cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry time-to-live in milliseconds
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    /// Maximum cached entries before LRU eviction
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            max_size: default_cache_max_size(),
        }
    }
}

impl CacheConfig {
    /// Entry time-to-live as a Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Request queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrently running queued requests
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_queue_concurrency(),
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Ring bound; oldest entries are evicted beyond this
    #[serde(default = "default_audit_max_logs")]
    pub max_logs: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_logs: default_audit_max_logs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bridge: BridgeConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults and environment variables
    pub fn load() -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("CAPGATE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file, then environment
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CAPGATE_").split("__"))
            .extract()?;
        Ok(config)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bridge_stable_ms() -> u64 {
    2_000
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_rate_max_requests() -> u32 {
    100
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_cache_max_size() -> usize {
    500
}

fn default_queue_concurrency() -> usize {
    5
}

fn default_audit_max_logs() -> usize {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rate_limiter.window_ms, 60_000);
        assert_eq!(config.rate_limiter.max_requests, 100);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(config.cache.ttl_ms, 300_000);
        assert_eq!(config.cache.max_size, 500);
        assert_eq!(config.queue.concurrency, 5);
        assert_eq!(config.bridge.stable_ms, 2_000);
        assert_eq!(config.audit.max_logs, 1_000);
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.bridge.stable(), Duration::from_secs(2));
        assert_eq!(config.rate_limiter.window(), Duration::from_secs(60));
        assert_eq!(
            config.circuit_breaker.reset_timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CAPGATE_RATE_LIMITER__MAX_REQUESTS", "7");
            jail.set_env("CAPGATE_QUEUE__CONCURRENCY", "2");
            let config = Config::load().expect("load");
            assert_eq!(config.rate_limiter.max_requests, 7);
            assert_eq!(config.queue.concurrency, 2);
            Ok(())
        });
    }

    #[test]
    fn test_load_from_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "capgate.toml",
                r#"
                log_level = "debug"

                [cache]
                ttl_ms = 1000
                max_size = 8
                "#,
            )?;
            let config = Config::load_from("capgate.toml").expect("load");
            assert_eq!(config.log_level, "debug");
            assert_eq!(config.cache.ttl_ms, 1_000);
            assert_eq!(config.cache.max_size, 8);
            // Untouched sections keep defaults
            assert_eq!(config.queue.concurrency, 5);
            Ok(())
        });
    }
}
