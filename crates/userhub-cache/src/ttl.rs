//! Expiry policy for cached entries.

use std::time::Duration;

use rand::Rng;

/// Fixed expiry of tombstones (confirmed-absent markers).
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Returns `base` plus a uniformly random jitter in `[0, jitter)`.
///
/// Spreading expiries keeps entries populated together (e.g. after a cold
/// start) from all expiring together.
pub fn jittered_ttl(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

/// TTLs applied by the cache-aside store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Base expiry of positive entries.
    pub base: Duration,
    /// Upper bound (exclusive) of the random extra expiry.
    pub jitter: Duration,
    /// Expiry of tombstones. Never jittered.
    pub tombstone: Duration,
}

impl TtlPolicy {
    /// Creates a policy with the default tombstone expiry.
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self {
            base,
            jitter,
            tombstone: DEFAULT_TOMBSTONE_TTL,
        }
    }

    /// Overrides the tombstone expiry.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone = ttl;
        self
    }

    /// Draws the expiry for a positive entry.
    pub fn entry_ttl(&self) -> Duration {
        jittered_ttl(self.base, self.jitter)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_jitter_returns_base() {
        assert_eq!(
            jittered_ttl(Duration::from_secs(10), Duration::ZERO),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let base = Duration::from_secs(300);
        let jitter = Duration::from_secs(60);
        for _ in 0..1_000 {
            let ttl = jittered_ttl(base, jitter);
            assert!(ttl >= base && ttl < base + jitter, "ttl {ttl:?} out of range");
        }
    }

    #[test]
    fn test_policy_tombstone_is_fixed() {
        let policy = TtlPolicy::new(Duration::from_secs(300), Duration::from_secs(60))
            .with_tombstone_ttl(Duration::from_secs(30));
        assert_eq!(policy.tombstone, Duration::from_secs(30));
        assert!(policy.entry_ttl() >= Duration::from_secs(300));
    }
}
