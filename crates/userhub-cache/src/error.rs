//! Error types for the cache layer.
//!
//! Two shapes live here. [`CacheError`] is an ordinary error that callers
//! propagate with `?`. [`Ignorable`] marks a failure on a best-effort path
//! (write-back after a read, the delayed second delete); it has no `From`
//! conversion into [`CacheError`], so it cannot be propagated by accident,
//! and the only thing to do with it is [`Ignorable::log`].

use std::sync::Arc;

use userhub_storage::StorageError;

/// Errors that can occur talking to the cache service or loading through it.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No connection could be checked out of the pool.
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// The cache service rejected or failed a command.
    #[error("Redis command error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A value could not be encoded for the cache.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The source of truth failed while loading a missing entry.
    #[error("Store error: {0}")]
    Store(#[source] Arc<StorageError>),

    /// A coalesced load ended without handing back a result.
    #[error("Coalesced load for {key} failed: {reason}")]
    Coalescer {
        /// Cache key of the load.
        key: String,
        /// What went wrong.
        reason: String,
    },

    /// The operation ran past its own deadline.
    #[error("Cache operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The caller's cancellation token fired.
    #[error("Cache operation cancelled")]
    Cancelled,
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        Self::Store(Arc::new(err))
    }
}

impl CacheError {
    /// Returns `true` if the caller's cancellation caused this error.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the underlying store error, if the failure came from the source of truth.
    #[must_use]
    pub fn as_store_error(&self) -> Option<&StorageError> {
        match self {
            Self::Store(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// A failure on a best-effort path.
///
/// The primary operation has already succeeded (or does not depend on this
/// step), so the failure is recorded and dropped.
#[derive(Debug, thiserror::Error)]
#[error("best-effort {op} failed for {key}: {source}")]
#[must_use = "best-effort failures must be logged with `.log()`"]
pub struct Ignorable {
    /// Operation name, e.g. `"write_back"`.
    pub op: &'static str,
    /// Cache key involved.
    pub key: String,
    /// The underlying failure.
    #[source]
    pub source: CacheError,
}

impl Ignorable {
    /// Wraps a failure on a best-effort path.
    pub fn new(op: &'static str, key: impl Into<String>, source: CacheError) -> Self {
        Self {
            op,
            key: key.into(),
            source,
        }
    }

    /// Records the failure and drops it.
    pub fn log(self) {
        crate::metrics::record_cache_write_failure(self.op);
        tracing::warn!(
            op = self.op,
            key = %self.key,
            error = %self.source,
            "best-effort cache operation failed"
        );
    }
}

/// Result of a best-effort operation.
pub type BestEffort = Result<(), Ignorable>;

/// Extension for consuming [`BestEffort`] results.
pub trait BestEffortExt {
    /// Logs the failure, if any.
    fn or_log(self);
}

impl BestEffortExt for BestEffort {
    fn or_log(self) {
        if let Err(ignored) = self {
            ignored.log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        let err: CacheError = StorageError::connection_error("db down").into();
        assert!(err.as_store_error().is_some());
        assert_eq!(err.to_string(), "Store error: Connection error: db down");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_ignorable_display() {
        let ignored = Ignorable::new("write_back", "user:info:alice", CacheError::Cancelled);
        assert_eq!(
            ignored.to_string(),
            "best-effort write_back failed for user:info:alice: Cache operation cancelled"
        );
        ignored.log();
    }

    #[test]
    fn test_or_log_accepts_success() {
        let ok: BestEffort = Ok(());
        ok.or_log();
    }
}
