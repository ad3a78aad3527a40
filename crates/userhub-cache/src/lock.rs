//! Distributed advisory lock over the cache service.
//!
//! Acquisition is `SET key token NX EX ttl` with a fresh random token per
//! attempt. Release and extension are compare-and-act scripts, so a holder
//! whose lock already expired and was taken by someone else cannot remove
//! or prolong the new holder's lock.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::DynCache;
use crate::error::CacheError;
use crate::metrics;

/// Errors from lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another holder kept the key for the whole retry budget.
    #[error("Lock {key} still held by another owner after {attempts} attempts")]
    AcquisitionFailed { key: String, attempts: u32 },

    /// The key is absent or holds someone else's token.
    #[error("Lock {key} is not held by this owner")]
    NotHeld { key: String },

    #[error("Acquisition of lock {key} cancelled")]
    Cancelled { key: String },

    #[error("Cache error on lock {key}: {source}")]
    Cache {
        key: String,
        #[source]
        source: CacheError,
    },
}

impl LockError {
    /// Returns `true` if the lock was busy, which callers report as a retryable conflict.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::AcquisitionFailed { .. })
    }
}

/// Parameters for [`DistributedLock::with_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub retry_interval: Duration,
    /// Deadline of the release call; independent of the caller's cancellation.
    pub release_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_attempts: 5,
            retry_interval: Duration::from_millis(50),
            release_timeout: Duration::from_secs(2),
        }
    }
}

/// A lock on one key of the cache service.
///
/// The handle remembers the token of its last successful acquisition.
/// Only that token can release or extend the key.
pub struct DistributedLock {
    cache: DynCache,
    key: String,
    ttl: Duration,
    token: Option<String>,
}

impl DistributedLock {
    pub fn new(cache: DynCache, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            key: key.into(),
            ttl,
            token: None,
        }
    }

    /// A handle that claims `token` without acquiring anything.
    ///
    /// Useful to release a lock on behalf of the owner that acquired it.
    pub fn with_token(
        cache: DynCache,
        key: impl Into<String>,
        ttl: Duration,
        token: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            key: key.into(),
            ttl,
            token: Some(token.into()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether this handle believes it holds the lock. The key may have expired since.
    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    fn cache_error(&self, source: CacheError) -> LockError {
        LockError::Cache {
            key: self.key.clone(),
            source,
        }
    }

    /// One acquisition attempt. Returns `false` if the key is held by someone else.
    pub async fn try_lock(&mut self, cancel: &CancellationToken) -> Result<bool, LockError> {
        let token = Uuid::new_v4().to_string();

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(LockError::Cancelled { key: self.key.clone() });
            }
            result = self.cache.set_nx(&self.key, token.as_bytes(), self.ttl) => {
                result.map_err(|e| self.cache_error(e))?
            }
        };

        if acquired {
            self.token = Some(token);
        }
        Ok(acquired)
    }

    /// Retries [`try_lock`](Self::try_lock) up to `max_attempts` times, sleeping
    /// `retry_interval` in between. A cache error aborts at once.
    pub async fn lock(
        &mut self,
        max_attempts: u32,
        retry_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LockError> {
        let max_attempts = max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.try_lock(cancel).await {
                Ok(true) => {
                    metrics::record_lock_acquire("acquired");
                    tracing::debug!(key = %self.key, attempt, "Lock acquired");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    let outcome = match e {
                        LockError::Cancelled { .. } => "cancelled",
                        _ => "error",
                    };
                    metrics::record_lock_acquire(outcome);
                    return Err(e);
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        metrics::record_lock_acquire("cancelled");
                        return Err(LockError::Cancelled { key: self.key.clone() });
                    }
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        }

        metrics::record_lock_acquire("busy");
        tracing::debug!(key = %self.key, attempts = max_attempts, "Lock busy");
        Err(LockError::AcquisitionFailed {
            key: self.key.clone(),
            attempts: max_attempts,
        })
    }

    /// Deletes the key if it still holds this handle's token.
    pub async fn unlock(&mut self) -> Result<(), LockError> {
        let Some(token) = self.token.as_deref() else {
            return Err(LockError::NotHeld {
                key: self.key.clone(),
            });
        };

        let released = self
            .cache
            .compare_and_delete(&self.key, token.as_bytes())
            .await
            .map_err(|e| self.cache_error(e))?;
        self.token = None;

        if released {
            tracing::debug!(key = %self.key, "Lock released");
            Ok(())
        } else {
            Err(LockError::NotHeld {
                key: self.key.clone(),
            })
        }
    }

    /// Resets the key's expiry to `ttl` if it still holds this handle's token.
    pub async fn extend(&mut self, ttl: Duration) -> Result<(), LockError> {
        let Some(token) = self.token.as_deref() else {
            return Err(LockError::NotHeld {
                key: self.key.clone(),
            });
        };

        let extended = self
            .cache
            .compare_and_expire(&self.key, token.as_bytes(), ttl)
            .await
            .map_err(|e| self.cache_error(e))?;

        if extended {
            self.ttl = ttl;
            Ok(())
        } else {
            Err(LockError::NotHeld {
                key: self.key.clone(),
            })
        }
    }

    /// Acquires the lock with bounded retry, runs `f`, and releases.
    ///
    /// The lock is taken with `options.ttl`, which replaces the TTL this
    /// handle was built with.
    ///
    /// The release runs on every exit path. On normal return and on panic it
    /// is awaited (the panic is resumed afterwards). If the returned future
    /// is dropped while `f` runs, the release is spawned onto the runtime.
    /// Release failures are logged; the lock's TTL bounds the damage.
    pub async fn with_lock<F, Fut, T>(
        mut self,
        options: &LockOptions,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.ttl = options.ttl;
        self.lock(options.max_attempts, options.retry_interval, cancel)
            .await?;

        let guard = ReleaseGuard {
            lock: Some(self),
            timeout: options.release_timeout,
        };

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        guard.release().await;

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("held", &self.token.is_some())
            .finish()
    }
}

struct ReleaseGuard {
    lock: Option<DistributedLock>,
    timeout: Duration,
}

impl ReleaseGuard {
    async fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            release_within(lock, self.timeout).await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_within(lock, self.timeout));
            }
            Err(_) => {
                tracing::warn!(key = %lock.key, "No runtime to release lock; it will expire by TTL");
            }
        }
    }
}

async fn release_within(mut lock: DistributedLock, timeout: Duration) {
    match tokio::time::timeout(timeout, lock.unlock()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(key = %lock.key, error = %e, "Failed to release lock"),
        Err(_) => tracing::warn!(
            key = %lock.key,
            timeout_ms = timeout.as_millis() as u64,
            "Lock release timed out"
        ),
    }
}
