use std::time::Duration;

use redis::IntoConnectionInfo;
use serde::{Deserialize, Serialize};

use crate::lock::LockOptions;
use crate::ttl::TtlPolicy;

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379", "rediss://" for TLS)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout and per-attempt ping timeout, in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts made by the connector before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay after the first failed attempt; doubles on each retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("redis.url must not be empty".into());
        }
        self.url
            .as_str()
            .into_connection_info()
            .map_err(|e| format!("redis.url is invalid: {e}"))?;
        if self.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.connect_attempts == 0 {
            return Err("redis.connect_attempts must be > 0".into());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("redis.initial_backoff_ms must be <= redis.max_backoff_ms".into());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Expiry settings for cached entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    /// Base expiry of cached entities in seconds
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Random extra expiry in seconds, drawn from `[0, jitter)`.
    /// Clamped to half the TTL if larger than the TTL.
    #[serde(default = "default_jitter_secs")]
    pub default_jitter_secs: u64,

    /// Expiry of "confirmed absent" markers in seconds
    #[serde(default = "default_tombstone_ttl_secs")]
    pub tombstone_ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_jitter_secs() -> u64 {
    60
}

fn default_tombstone_ttl_secs() -> u64 {
    60
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            default_jitter_secs: default_jitter_secs(),
            tombstone_ttl_secs: default_tombstone_ttl_secs(),
        }
    }
}

impl CacheTtlConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl_secs == 0 {
            return Err("cache.default_ttl_secs must be > 0".into());
        }
        if self.tombstone_ttl_secs == 0 {
            return Err("cache.tombstone_ttl_secs must be > 0".into());
        }
        Ok(())
    }

    /// Returns a copy with the jitter clamped to half the TTL when it exceeds the TTL.
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.default_jitter_secs > cfg.default_ttl_secs {
            cfg.default_jitter_secs = cfg.default_ttl_secs / 2;
        }
        cfg
    }

    pub fn policy(&self) -> TtlPolicy {
        let cfg = self.normalized();
        TtlPolicy::new(
            Duration::from_secs(cfg.default_ttl_secs),
            Duration::from_secs(cfg.default_jitter_secs),
        )
        .with_tombstone_ttl(Duration::from_secs(cfg.tombstone_ttl_secs))
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock expiry in seconds; bounds how long a crashed holder blocks others
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,

    /// Acquisition attempts before reporting the key as busy
    #[serde(default = "default_lock_max_attempts")]
    pub max_attempts: u32,

    /// Sleep between acquisition attempts in milliseconds
    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Deadline for the release call in milliseconds, independent of the caller
    #[serde(default = "default_lock_release_timeout_ms")]
    pub release_timeout_ms: u64,
}

fn default_lock_ttl_secs() -> u64 {
    10
}

fn default_lock_max_attempts() -> u32 {
    5
}

fn default_lock_retry_interval_ms() -> u64 {
    50
}

fn default_lock_release_timeout_ms() -> u64 {
    2000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            max_attempts: default_lock_max_attempts(),
            retry_interval_ms: default_lock_retry_interval_ms(),
            release_timeout_ms: default_lock_release_timeout_ms(),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("lock.ttl_secs must be > 0".into());
        }
        if self.max_attempts == 0 {
            return Err("lock.max_attempts must be > 0".into());
        }
        if self.release_timeout_ms == 0 {
            return Err("lock.release_timeout_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn options(&self) -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(self.ttl_secs),
            max_attempts: self.max_attempts,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            release_timeout: Duration::from_millis(self.release_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_validation() {
        assert!(RedisConfig::default().validate().is_ok());

        let bad_url = RedisConfig {
            url: "http://localhost".into(),
            ..Default::default()
        };
        assert!(bad_url.validate().is_err());

        let no_pool = RedisConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert_eq!(
            no_pool.validate().unwrap_err(),
            "redis.pool_size must be > 0"
        );

        let inverted = RedisConfig {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 1_000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_jitter_clamped_to_half_ttl() {
        let cfg = CacheTtlConfig {
            default_ttl_secs: 100,
            default_jitter_secs: 500,
            tombstone_ttl_secs: 60,
        };
        assert_eq!(cfg.normalized().default_jitter_secs, 50);

        let policy = cfg.policy();
        assert_eq!(policy.base, Duration::from_secs(100));
        assert_eq!(policy.jitter, Duration::from_secs(50));
        assert_eq!(policy.tombstone, Duration::from_secs(60));
    }

    #[test]
    fn test_lock_options_from_defaults() {
        let options = LockConfig::default().options();
        assert_eq!(options.ttl, Duration::from_secs(10));
        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.retry_interval, Duration::from_millis(50));
        assert_eq!(options.release_timeout, Duration::from_secs(2));
    }
}
