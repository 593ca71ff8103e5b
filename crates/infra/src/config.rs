//! Configuration loading and representation.
//!
//! Every knob has a default; `from_env` overrides individual values from
//! `COURIER_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::delivery::{DeliveryConfig, RetryPolicy};
use crate::lock::LockConfig;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the reliability layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub cache: CacheConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub delivery: DeliveryConfig,
    pub lock: LockConfig,
}

impl ReliabilityConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (tests, layered config sources).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut cfg = Self::default();

        if let Some(v) = env.parse::<usize>("COURIER_MAX_CACHE_SIZE")? {
            cfg.cache.max_size = v;
        }
        if let Some(v) = env.secs("COURIER_IDLE_TIMEOUT_SECS")? {
            cfg.cache.idle_timeout = v;
        }
        if let Some(v) = env.secs("COURIER_SWEEP_INTERVAL_SECS")? {
            cfg.cache.sweep_interval = v;
        }
        if let Some(v) = env.millis("COURIER_HANDLE_CREATE_TIMEOUT_MS")? {
            cfg.cache.create_timeout = v;
        }

        if let Some(v) = env.parse::<u32>("COURIER_FAILURE_THRESHOLD")? {
            cfg.breaker.failure_threshold = v;
        }
        if let Some(v) = env.secs("COURIER_RESET_TIMEOUT_SECS")? {
            cfg.breaker.reset_timeout = v;
        }

        if let Some(v) = env.parse::<u32>("COURIER_MAX_RETRIES")? {
            cfg.retry.max_attempts = v;
        }
        if let Some(v) = env.millis("COURIER_INITIAL_DELAY_MS")? {
            cfg.retry.initial_delay = v;
        }
        if let Some(v) = env.parse::<f64>("COURIER_BACKOFF_MULTIPLIER")? {
            cfg.retry.multiplier = v;
        }
        if let Some(v) = env.millis("COURIER_MAX_DELAY_MS")? {
            cfg.retry.max_delay = Some(v);
        }

        if let Some(v) = env.millis("COURIER_SEND_TIMEOUT_MS")? {
            cfg.delivery.attempt_timeout = v;
        }
        if let Some(v) = env.secs("COURIER_DLQ_RETENTION_SECS")? {
            cfg.delivery.dlq_retention = v;
        }

        if let Some(v) = env.secs("COURIER_LOCK_TTL_SECS")? {
            cfg.lock.default_ttl = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::Invalid("cache max_size must be at least 1".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be >= 1.0 (got {})",
                self.retry.multiplier
            )));
        }
        if self.lock.default_ttl.is_zero() {
            return Err(ConfigError::Invalid("lock ttl must be non-zero".into()));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
    }

    fn secs(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
