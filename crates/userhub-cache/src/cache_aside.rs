//! Cache-aside repository.
//!
//! Reads go to the cache first and fall back to the store on a miss. Store
//! loads for the same key are coalesced, confirmed absences are cached as
//! short-lived tombstones, and positive entries get a jittered expiry.
//!
//! The cache is never authoritative: an unreachable cache or an entry that
//! does not decode is treated as a miss.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use userhub_storage::StorageError;

use crate::backend::{DynCache, KvCache};
use crate::error::{BestEffort, BestEffortExt, CacheError, Ignorable};
use crate::key::CacheKey;
use crate::metrics;
use crate::single_flight::{FlightError, SingleFlight};
use crate::ttl::TtlPolicy;

/// Marker stored for keys the store confirmed absent.
pub const TOMBSTONE: &[u8] = b"null";

/// An entity that can be cached under a natural key.
pub trait CacheEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key prefix, e.g. `"user:info"`.
    const NAMESPACE: &'static str;

    /// The key the entity is addressed by.
    fn natural_key(&self) -> &str;
}

/// Reads an entity from the source of truth.
#[async_trait]
pub trait EntityLoader<E>: Send + Sync + 'static {
    /// `Ok(None)` means the store confirmed the key does not exist.
    async fn load(&self, key: &str) -> Result<Option<E>, StorageError>;
}

type LoadResult<E> = Result<Option<E>, Arc<StorageError>>;

enum Cached<E> {
    Entry(E),
    Tombstone,
    Miss,
}

/// Cache-aside reads and writes for one entity type.
pub struct CacheAsideStore<E, L> {
    cache: DynCache,
    loader: Arc<L>,
    flights: SingleFlight<LoadResult<E>>,
    ttl: TtlPolicy,
    _entity: PhantomData<fn() -> E>,
}

impl<E, L> CacheAsideStore<E, L>
where
    E: CacheEntity,
    L: EntityLoader<E>,
{
    pub fn new(cache: DynCache, loader: L, ttl: TtlPolicy) -> Self {
        Self {
            cache,
            loader: Arc::new(loader),
            flights: SingleFlight::new(),
            ttl,
            _entity: PhantomData,
        }
    }

    /// Cache key for a natural key.
    pub fn cache_key(key: &str) -> CacheKey {
        CacheKey::new(E::NAMESPACE, key)
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn cache(&self) -> &DynCache {
        &self.cache
    }

    /// Reads an entity, loading it from the store on a miss.
    ///
    /// Returns `Ok(None)` when the store confirms absence (or a tombstone
    /// says so). Store failures are returned and never cached.
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<E>, CacheError> {
        let cache_key = Self::cache_key(key);

        match self.read_cached(&cache_key, cancel).await? {
            Cached::Entry(entity) => return Ok(Some(entity)),
            Cached::Tombstone => return Ok(None),
            Cached::Miss => metrics::record_cache_miss(),
        }

        let cache = Arc::clone(&self.cache);
        let loader = Arc::clone(&self.loader);
        let ttl = self.ttl;
        let natural_key = key.to_owned();
        let load_key = cache_key.clone();

        let flight = self
            .flights
            .run(
                cache_key.as_str(),
                move || load_and_fill(cache, loader, ttl, natural_key, load_key),
                cancel,
            )
            .await
            .map_err(|e| match e {
                FlightError::Cancelled => CacheError::Cancelled,
                FlightError::Aborted => CacheError::Coalescer {
                    key: cache_key.to_string(),
                    reason: e.to_string(),
                },
            })?;

        if flight.shared {
            tracing::debug!(key = %cache_key, "Served from coalesced load");
        }
        flight.value.map_err(CacheError::Store)
    }

    /// Writes an entity under its natural key with a jittered expiry.
    pub async fn set(&self, entity: &E) -> Result<(), CacheError> {
        let cache_key = Self::cache_key(entity.natural_key());
        write_entry(self.cache.as_ref(), &cache_key, entity, &self.ttl).await
    }

    /// Like [`set`](Self::set); `None` writes nothing.
    pub async fn set_opt(&self, entity: Option<&E>) -> Result<(), CacheError> {
        match entity {
            Some(entity) => self.set(entity).await,
            None => Ok(()),
        }
    }

    /// Deletes the cached entry (value or tombstone). Returns `true` if one existed.
    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        let cache_key = Self::cache_key(key);
        let removed = self.cache.delete(cache_key.as_str()).await?;
        tracing::debug!(key = %cache_key, removed, "Cache entry invalidated");
        Ok(removed)
    }

    async fn read_cached(
        &self,
        cache_key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Result<Cached<E>, CacheError> {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            read = self.cache.get(cache_key.as_str()) => read,
        };

        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(Cached::Miss),
            Err(e) => {
                tracing::warn!(key = %cache_key, error = %e, "Cache read failed, falling back to store");
                return Ok(Cached::Miss);
            }
        };

        if bytes == TOMBSTONE {
            metrics::record_cache_hit("tombstone");
            return Ok(Cached::Tombstone);
        }

        match rmp_serde::from_slice::<E>(&bytes) {
            Ok(entity) => {
                metrics::record_cache_hit("entry");
                Ok(Cached::Entry(entity))
            }
            Err(e) => {
                tracing::warn!(key = %cache_key, error = %e, "Cached entry does not decode, reloading");
                Ok(Cached::Miss)
            }
        }
    }
}

async fn write_entry<E: Serialize>(
    cache: &dyn KvCache,
    cache_key: &CacheKey,
    entity: &E,
    ttl: &TtlPolicy,
) -> Result<(), CacheError> {
    let bytes =
        rmp_serde::to_vec_named(entity).map_err(|e| CacheError::Serialization(e.to_string()))?;
    cache.set(cache_key.as_str(), &bytes, ttl.entry_ttl()).await
}

async fn load_and_fill<E, L>(
    cache: DynCache,
    loader: Arc<L>,
    ttl: TtlPolicy,
    key: String,
    cache_key: CacheKey,
) -> LoadResult<E>
where
    E: CacheEntity,
    L: EntityLoader<E>,
{
    metrics::record_store_load();

    match loader.load(&key).await {
        Ok(Some(entity)) => {
            let written: BestEffort = write_entry(cache.as_ref(), &cache_key, &entity, &ttl)
                .await
                .map_err(|e| Ignorable::new("write_back", cache_key.as_str(), e));
            written.or_log();
            Ok(Some(entity))
        }
        Ok(None) => {
            let written: BestEffort = cache
                .set(cache_key.as_str(), TOMBSTONE, ttl.tombstone)
                .await
                .map_err(|e| Ignorable::new("tombstone", cache_key.as_str(), e));
            written.or_log();
            tracing::debug!(key = %cache_key, "Store confirmed absence, tombstone written");
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(key = %cache_key, category = %e.category(), error = %e, "Store load failed");
            Err(Arc::new(e))
        }
    }
}
