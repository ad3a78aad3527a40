//! Error types for the user services.

use userhub_cache::{CacheError, LockError};
use userhub_storage::StorageError;

/// Errors from a cache-invalidating mutation.
#[derive(Debug, thiserror::Error)]
pub enum MutationError<E> {
    /// The first delete failed, so the mutation was not attempted.
    #[error("Invalidation of {key} failed before mutating: {source}")]
    Invalidate {
        key: String,
        #[source]
        source: CacheError,
    },

    /// The mutation itself failed.
    #[error(transparent)]
    Mutation(E),
}

/// Errors returned by [`UserService`](crate::UserService).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("missing username")]
    MissingUsername,

    #[error("user not found")]
    UserNotFound,

    #[error("username already exists")]
    UsernameExists,

    #[error("email already exists")]
    EmailExists,

    #[error("phone already exists")]
    PhoneExists,

    /// A unique constraint fired but no attribute could be pinned down.
    #[error("user already exists")]
    UserExists,

    #[error("old password does not match")]
    OldPasswordMismatch,

    #[error("new password cannot be the same as the old password")]
    NewPasswordSameAsOld,

    #[error("password is too weak: {0}")]
    WeakPassword(String),

    /// Another request holds the lock for this key; safe to retry.
    #[error("{key} is busy, retry later")]
    Busy { key: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("cache error: {0}")]
    Cache(CacheError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("password hashing error: {0}")]
    Password(String),
}

impl ServiceError {
    /// Returns `true` for conflicts the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Cancelled => Self::Cancelled,
            other => Self::Cache(other),
        }
    }
}

impl From<LockError> for ServiceError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AcquisitionFailed { key, .. } | LockError::NotHeld { key } => {
                Self::Busy { key }
            }
            LockError::Cancelled { .. } => Self::Cancelled,
            LockError::Cache { source, .. } => source.into(),
        }
    }
}

impl From<MutationError<ServiceError>> for ServiceError {
    fn from(err: MutationError<ServiceError>) -> Self {
        match err {
            MutationError::Invalidate { source, .. } => source.into(),
            MutationError::Mutation(inner) => inner,
        }
    }
}
