//! Cache and lock key construction.
//!
//! Data entries live under `"<namespace>:<key>"` and locks under
//! `"lock:<entity>:<operation>:<key>"`, so unrelated subsystems can share
//! one cache service.

use std::fmt;

/// Prefix shared by every lock key.
pub const LOCK_PREFIX: &str = "lock";

/// Key of a cached data entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds `"<namespace>:<key>"`.
    pub fn new(namespace: &str, key: &str) -> Self {
        Self(format!("{namespace}:{key}"))
    }

    /// Returns the key as sent to the cache service.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Key of a distributed lock scoped to one business key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// Builds `"lock:<entity>:<operation>:<key>"`.
    pub fn new(entity: &str, operation: &str, key: &str) -> Self {
        Self(format!("{LOCK_PREFIX}:{entity}:{operation}:{key}"))
    }

    /// Returns the key as sent to the cache service.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<LockKey> for String {
    fn from(key: LockKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let key = CacheKey::new("user:info", "bob");
        assert_eq!(key.as_str(), "user:info:bob");
        assert_eq!(key, CacheKey::new("user:info", "bob"));
        assert_ne!(key, CacheKey::new("user:session", "bob"));
    }

    #[test]
    fn test_lock_key_format() {
        let key = LockKey::new("user", "register", "alice");
        assert_eq!(key.to_string(), "lock:user:register:alice");
    }
}
