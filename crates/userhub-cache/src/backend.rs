//! Cache service backends.
//!
//! [`KvCache`] is the byte-oriented contract the rest of the crate talks to.
//! Two implementations are provided:
//!
//! - [`RedisCache`]: shared across instances, atomic check-then-act via Lua
//! - [`MemoryCache`]: single-instance `DashMap`, expiry on the tokio clock
//!
//! | Operation            | Redis command                                  |
//! |----------------------|------------------------------------------------|
//! | `get`                | `GET key`                                      |
//! | `set`                | `SET key value PX ttl_ms`                      |
//! | `set_nx`             | `SET key value NX EX ttl_secs`                 |
//! | `delete`             | `DEL key`                                      |
//! | `compare_and_delete` | `if GET(key) == v then DEL(key)` (Lua)         |
//! | `compare_and_expire` | `if GET(key) == v then EXPIRE(key, ttl)` (Lua) |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tokio::time::Instant;

use crate::error::CacheError;

/// Byte-oriented key-value cache with TTLs and atomic conditional operations.
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Reads a value. `None` means the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Writes a value with an expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Writes a value only if the key is absent. Returns `true` if this call created it.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError>;

    /// Removes a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes a key only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError>;

    /// Resets a key's expiry only if it currently holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Remaining time to live. `None` if the key is absent or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Name of this backend for logging.
    fn backend_name(&self) -> &'static str;
}

/// Shared cache trait object.
pub type DynCache = Arc<dyn KvCache>;

/// Whole seconds for `EX`/`EXPIRE`, never below one.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Whole milliseconds for `PX`, never below one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

// =============================================================================
// Redis
// =============================================================================

/// Deletes `KEYS[1]` only if it holds `ARGV[1]`.
pub const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Sets the expiry of `KEYS[1]` to `ARGV[2]` seconds only if it holds `ARGV[1]`.
pub const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

static COMPARE_AND_DELETE: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(COMPARE_AND_DELETE_SCRIPT));

static COMPARE_AND_EXPIRE: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(COMPARE_AND_EXPIRE_SCRIPT));

/// Redis-backed cache over a shared connection pool.
///
/// The pool is safe to use concurrently; no in-process locking is done
/// around individual commands.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Wraps an established pool (see [`crate::ResilientConnector`]).
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool.get().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to get Redis connection");
            CacheError::Pool(e.to_string())
        })
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        let value = conn.get::<_, Option<Vec<u8>>>(key).await?;
        tracing::trace!(key = %key, hit = value.is_some(), "redis GET");
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?;
        tracing::trace!(key = %key, ttl_ms = ttl_millis(ttl), "redis SET");
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let removed: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let updated: i64 = COMPARE_AND_EXPIRE
            .key(key)
            .arg(expected)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn().await?;
        let remaining_ms: i64 = conn.pttl(key).await?;
        // -2: no such key, -1: no expiry.
        Ok(u64::try_from(remaining_ms).ok().map(Duration::from_millis))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` to allow cheap cloning on cache hits.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.cached_at.elapsed())
    }

    fn holds(&self, expected: &[u8]) -> bool {
        !self.is_expired() && self.data.as_slice() == expected
    }
}

/// Writes between two sweeps of expired entries.
pub const SWEEP_EVERY_WRITES: u64 = 1024;

/// Single-instance cache on a `DashMap`.
///
/// Each conditional operation runs under the map's per-key entry lock, which
/// gives the same atomicity the Lua scripts give on Redis. Expiry uses the
/// tokio clock, so tests can drive it with paused time.
///
/// Expired entries are dropped when their key is touched, and every
/// [`SWEEP_EVERY_WRITES`] writes the whole map is swept, so keys that are
/// written once and never read again (tombstones for unknown names) do not
/// accumulate.
#[derive(Clone, Default)]
pub struct MemoryCache {
    map: Arc<DashMap<String, CachedEntry>>,
    writes: Arc<AtomicU64>,
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until swept or touched.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.map.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.map.len(), "Swept expired cache entries");
        }
        removed
    }

    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(entry) = self.map.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.data.to_vec()));
            }
            drop(entry);
            self.map.remove_if(key, |_, e| e.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.map
            .insert(key.to_string(), CachedEntry::new(value.to_vec(), ttl));
        self.after_write();
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError> {
        let acquired = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(CachedEntry::new(value.to_vec(), ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CachedEntry::new(value.to_vec(), ttl));
                true
            }
        };
        if acquired {
            self.after_write();
        }
        Ok(acquired)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        Ok(self.map.remove_if(key, |_, e| e.holds(expected)).is_some())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        match self.map.get_mut(key) {
            Some(mut entry) if entry.holds(expected) => {
                entry.cached_at = Instant::now();
                entry.ttl = ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        Ok(self
            .map
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.remaining()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_get_set_expire() {
        let cache = MemoryCache::new();
        cache
            .set("k", b"v", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(
            cache.ttl("k").await.unwrap(),
            Some(Duration::from_millis(100))
        );

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_set_nx_respects_expiry() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(10);

        assert!(cache.set_nx("lock", b"a", ttl).await.unwrap());
        assert!(!cache.set_nx("lock", b"b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.set_nx("lock", b"b", ttl).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_compare_and_delete() {
        let cache = MemoryCache::new();
        cache.set("lock", b"mine", Duration::from_secs(10)).await.unwrap();

        assert!(!cache.compare_and_delete("lock", b"theirs").await.unwrap());
        assert!(cache.get("lock").await.unwrap().is_some());

        assert!(cache.compare_and_delete("lock", b"mine").await.unwrap());
        assert!(cache.get("lock").await.unwrap().is_none());
        assert!(!cache.compare_and_delete("lock", b"mine").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_compare_and_expire() {
        let cache = MemoryCache::new();
        cache.set("lock", b"mine", Duration::from_secs(1)).await.unwrap();

        assert!(
            !cache
                .compare_and_expire("lock", b"theirs", Duration::from_secs(30))
                .await
                .unwrap()
        );
        assert!(
            cache
                .compare_and_expire("lock", b"mine", Duration::from_secs(30))
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get("lock").await.unwrap().is_some());
        assert_eq!(
            cache.ttl("lock").await.unwrap(),
            Some(Duration::from_secs(25))
        );
    }

    #[tokio::test]
    async fn test_memory_delete_reports_presence() {
        let cache = MemoryCache::new();
        assert!(!cache.delete("missing").await.unwrap());
        cache.set("k", b"v", Duration::from_secs(5)).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_sweeps_unread_expired_entries() {
        let cache = MemoryCache::new();
        for i in 0..10_000 {
            cache
                .set(&format!("user:info:ghost{i}"), b"null", Duration::from_secs(60))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(3600)).await;

        for i in 0..SWEEP_EVERY_WRITES {
            cache
                .set(&format!("user:info:fresh{i}"), b"v", Duration::from_secs(300))
                .await
                .unwrap();
        }

        // The sweep ran at write 10_240; the tombstones are gone without a read.
        assert_eq!(cache.len(), SWEEP_EVERY_WRITES as usize);
        assert!(cache.get("user:info:fresh0").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_purge_keeps_live_entries() {
        let cache = MemoryCache::new();
        cache.set("short", b"a", Duration::from_secs(1)).await.unwrap();
        cache.set("long", b"b", Duration::from_secs(100)).await.unwrap();
        assert!(cache.set_nx("lock", b"t", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn test_ttl_rounding() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(10)), 10);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_scripts_check_token_before_acting() {
        assert!(COMPARE_AND_DELETE_SCRIPT.contains(r#"redis.call("GET", KEYS[1]) == ARGV[1]"#));
        assert!(COMPARE_AND_DELETE_SCRIPT.contains(r#"redis.call("DEL", KEYS[1])"#));
        assert!(COMPARE_AND_EXPIRE_SCRIPT.contains(r#"redis.call("EXPIRE", KEYS[1], ARGV[2])"#));
    }
}
