//! # userhub-cache
//!
//! Keeps a remote key-value cache coherent with the user store.
//!
//! ## Overview
//!
//! - [`KvCache`]: byte-oriented cache contract, implemented by [`RedisCache`]
//!   (shared, Lua-scripted conditional ops) and [`MemoryCache`] (`DashMap`).
//! - [`ResilientConnector`]: builds a Redis pool with classified retry.
//! - [`DistributedLock`]: token-owned advisory lock with bounded acquisition.
//! - [`SingleFlight`]: coalesces concurrent loads of one key.
//! - [`CacheAsideStore`]: read-through with tombstones and TTL jitter.
//!
//! Every suspending call takes a [`CancellationToken`](tokio_util::sync::CancellationToken).

pub mod backend;
pub mod cache_aside;
pub mod config;
pub mod connector;
pub mod error;
pub mod key;
pub mod lock;
pub mod metrics;
pub mod single_flight;
pub mod ttl;
pub mod user;

pub use backend::{CachedEntry, DynCache, KvCache, MemoryCache, RedisCache};
pub use cache_aside::{CacheAsideStore, CacheEntity, EntityLoader, TOMBSTONE};
pub use config::{CacheTtlConfig, LockConfig, RedisConfig};
pub use connector::{ConnectError, ErrorClass, ResilientConnector};
pub use error::{BestEffort, BestEffortExt, CacheError, Ignorable};
pub use key::{CacheKey, LockKey};
pub use lock::{DistributedLock, LockError, LockOptions};
pub use single_flight::{Flight, FlightError, SingleFlight};
pub use ttl::{TtlPolicy, jittered_ttl};
pub use user::{StoreLoader, USER_NAMESPACE, UserCache, user_cache};

/// Connects to Redis and wraps the pool as a shared cache.
pub async fn connect_redis(
    config: &RedisConfig,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<DynCache, ConnectError> {
    let pool = ResilientConnector::new(config.clone())
        .connect(cancel)
        .await?;
    Ok(std::sync::Arc::new(RedisCache::new(pool)))
}
