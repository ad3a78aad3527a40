//! Resilient connection setup for the cache service.
//!
//! Each attempt builds a fresh pool, checks out one connection and issues
//! `PING` under the configured timeout. A pool whose check fails is closed
//! and never reused. Failures are classified: retryable ones are retried
//! with capped exponential backoff, fatal ones abort at once.

use std::time::Duration;

use deadpool_redis::{Pool, PoolConfig, PoolError, Runtime};
use redis::{ErrorKind, RedisError};
use tokio_util::sync::CancellationToken;

use crate::config::RedisConfig;
use crate::metrics;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: the server may accept a later attempt.
    Retryable,
    /// Permanent: retrying cannot help.
    Fatal,
}

/// Errors returned by [`ResilientConnector::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid Redis configuration: {0}")]
    InvalidConfig(String),

    #[error("Redis connection failed permanently on attempt {attempt}: {message}")]
    Fatal { attempt: u32, message: String },

    #[error("Redis connection failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("Redis connection cancelled")]
    Cancelled,
}

/// Classifies a server reply or transport failure by kind, reply code and message.
pub fn classify(kind: ErrorKind, code: Option<&str>, message: &str) -> ErrorClass {
    match code {
        Some("NOAUTH" | "WRONGPASS" | "NOPERM" | "OOM" | "EXECABORT") => {
            return ErrorClass::Fatal;
        }
        Some("LOADING" | "TRYAGAIN" | "CLUSTERDOWN" | "MASTERDOWN") => {
            return ErrorClass::Retryable;
        }
        _ => {}
    }

    if message.contains("max number of clients") {
        return ErrorClass::Retryable;
    }

    match kind {
        ErrorKind::BusyLoadingError
        | ErrorKind::TryAgain
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::IoError => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

/// Classifies an error from the redis client.
pub fn classify_redis_error(err: &RedisError) -> ErrorClass {
    if err.is_timeout() || err.is_connection_refusal() || err.is_connection_dropped() {
        return ErrorClass::Retryable;
    }
    classify(err.kind(), err.code(), &err.to_string())
}

/// Classifies an error from the connection pool.
pub fn classify_pool_error(err: &PoolError) -> ErrorClass {
    match err {
        PoolError::Timeout(_) => ErrorClass::Retryable,
        PoolError::Backend(e) => classify_redis_error(e),
        _ => ErrorClass::Fatal,
    }
}

/// Delay before attempt `attempt + 1`: `initial * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    initial.saturating_mul(1u32 << exponent).min(max)
}

#[derive(Debug)]
struct AttemptFailure {
    class: ErrorClass,
    message: String,
}

impl AttemptFailure {
    fn from_pool(err: &PoolError) -> Self {
        Self {
            class: classify_pool_error(err),
            message: err.to_string(),
        }
    }

    fn from_redis(err: &RedisError) -> Self {
        Self {
            class: classify_redis_error(err),
            message: err.to_string(),
        }
    }
}

/// Connects to the cache service with classified retry.
#[derive(Debug, Clone)]
pub struct ResilientConnector {
    config: RedisConfig,
}

impl ResilientConnector {
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Returns a pool that has answered `PING`.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<Pool, ConnectError> {
        self.config.validate().map_err(ConnectError::InvalidConfig)?;

        let attempts = self.config.connect_attempts;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                result = self.attempt() => result,
            };

            let failure = match result {
                Ok(pool) => {
                    metrics::record_connect_attempt("ok");
                    tracing::info!(attempt, "Connected to Redis");
                    return Ok(pool);
                }
                Err(failure) => failure,
            };

            if failure.class == ErrorClass::Fatal {
                metrics::record_connect_attempt("fatal");
                tracing::error!(attempt, error = %failure.message, "Redis connection failed permanently");
                return Err(ConnectError::Fatal {
                    attempt,
                    message: failure.message,
                });
            }

            metrics::record_connect_attempt("retryable");
            last_error = failure.message;

            if attempt < attempts {
                let delay = backoff_delay(
                    attempt,
                    self.config.initial_backoff(),
                    self.config.max_backoff(),
                );
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Redis connection attempt failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        tracing::error!(attempts, error = %last_error, "Redis connection attempts exhausted");
        Err(ConnectError::Exhausted {
            attempts,
            message: last_error,
        })
    }

    async fn attempt(&self) -> Result<Pool, AttemptFailure> {
        let timeout = self.config.timeout();

        let mut pool_config = PoolConfig::new(self.config.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let mut redis_config = deadpool_redis::Config::from_url(&self.config.url);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| AttemptFailure {
                class: ErrorClass::Fatal,
                message: e.to_string(),
            })?;

        match tokio::time::timeout(timeout, ping(&pool)).await {
            Ok(Ok(())) => Ok(pool),
            Ok(Err(failure)) => {
                pool.close();
                Err(failure)
            }
            Err(_) => {
                pool.close();
                Err(AttemptFailure {
                    class: ErrorClass::Retryable,
                    message: format!("PING timed out after {}ms", timeout.as_millis()),
                })
            }
        }
    }
}

async fn ping(pool: &Pool) -> Result<(), AttemptFailure> {
    let mut conn = pool.get().await.map_err(|e| AttemptFailure::from_pool(&e))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| AttemptFailure::from_redis(&e))?;
    Ok(())
}
