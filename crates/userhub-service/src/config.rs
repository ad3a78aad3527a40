use std::time::Duration;

use serde::{Deserialize, Serialize};
use userhub_cache::{CacheTtlConfig, LockConfig, RedisConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheTtlConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.redis.validate()?;
        self.cache.validate()?;
        self.lock.validate()?;
        self.invalidation.validate()?;
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

/// Delayed second delete of the double-delete protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Wait after the mutation before deleting the cache entry again
    #[serde(default = "default_second_delete_delay_ms")]
    pub second_delete_delay_ms: u64,
    /// Deadline of the second delete itself
    #[serde(default = "default_second_delete_timeout_ms")]
    pub second_delete_timeout_ms: u64,
}

fn default_second_delete_delay_ms() -> u64 {
    500
}

fn default_second_delete_timeout_ms() -> u64 {
    3000
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            second_delete_delay_ms: default_second_delete_delay_ms(),
            second_delete_timeout_ms: default_second_delete_timeout_ms(),
        }
    }
}

impl InvalidationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.second_delete_timeout_ms == 0 {
            return Err("invalidation.second_delete_timeout_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn second_delete_delay(&self) -> Duration {
        Duration::from_millis(self.second_delete_delay_ms)
    }

    pub fn second_delete_timeout(&self) -> Duration {
        Duration::from_millis(self.second_delete_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let file = PathBuf::from(path.unwrap_or("userhub.toml"));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        }
        // Environment variable overrides, e.g., USERHUB__REDIS__POOL_SIZE=20
        builder = builder.add_source(
            Environment::with_prefix("USERHUB")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
