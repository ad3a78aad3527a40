//! Consistency protocol for writes.
//!
//! Check-then-act sequences run under a per-key [`DistributedLock`].
//! Mutations of cached entities use a double delete: the cache entry is
//! deleted before the store write and once more after a short delay, so a
//! reader that repopulated the entry from the old row in between is
//! overwritten.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use userhub_cache::{
    BestEffort, BestEffortExt, CacheError, CacheKey, DistributedLock, DynCache, Ignorable,
    LockError, LockKey, LockOptions,
};

use crate::config::InvalidationConfig;
use crate::error::MutationError;

/// Outcome of [`MutationCoordinator::double_delete`].
#[derive(Debug)]
pub struct Mutated<T> {
    pub value: T,
    /// The scheduled second delete. Dropping the handle does not cancel it.
    pub second_delete: JoinHandle<()>,
}

/// Runs write operations under the lock and invalidation protocol.
#[derive(Clone)]
pub struct MutationCoordinator {
    cache: DynCache,
    lock: LockOptions,
    second_delete_delay: Duration,
    second_delete_timeout: Duration,
}

impl MutationCoordinator {
    pub fn new(cache: DynCache, lock: LockOptions, invalidation: &InvalidationConfig) -> Self {
        Self {
            cache,
            lock,
            second_delete_delay: invalidation.second_delete_delay(),
            second_delete_timeout: invalidation.second_delete_timeout(),
        }
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock
    }

    /// Runs `f` while holding `lock_key`.
    pub async fn guarded<F, Fut, T>(
        &self,
        lock_key: &LockKey,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        DistributedLock::new(self.cache.clone(), lock_key.clone(), self.lock.ttl)
            .with_lock(&self.lock, cancel, f)
            .await
    }

    /// Deletes `cache_key`, runs `mutation`, then schedules a second delete.
    ///
    /// A failed first delete aborts before the mutation. The second delete
    /// runs in the background after the configured delay under its own
    /// timeout; its failure is logged only.
    pub async fn double_delete<F, Fut, T, E>(
        &self,
        cache_key: &CacheKey,
        cancel: &CancellationToken,
        mutation: F,
    ) -> Result<Mutated<T>, MutationError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            deleted = self.cache.delete(cache_key.as_str()) => deleted,
        };
        first.map_err(|source| MutationError::Invalidate {
            key: cache_key.to_string(),
            source,
        })?;
        tracing::debug!(key = %cache_key, "First cache delete done");

        let value = mutation().await.map_err(MutationError::Mutation)?;

        let second_delete = tokio::spawn(second_delete(
            self.cache.clone(),
            cache_key.to_string(),
            self.second_delete_delay,
            self.second_delete_timeout,
        ));

        Ok(Mutated {
            value,
            second_delete,
        })
    }
}

async fn second_delete(cache: DynCache, key: String, delay: Duration, timeout: Duration) {
    tokio::time::sleep(delay).await;

    let outcome: BestEffort = match tokio::time::timeout(timeout, cache.delete(&key)).await {
        Ok(Ok(_)) => {
            tracing::debug!(key = %key, "Second cache delete done");
            Ok(())
        }
        Ok(Err(e)) => Err(Ignorable::new("second_delete", key, e)),
        Err(_) => Err(Ignorable::new(
            "second_delete",
            key,
            CacheError::Timeout(timeout),
        )),
    };
    outcome.or_log();
}
