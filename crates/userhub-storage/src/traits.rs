//! Store traits for the user storage abstraction.
//!
//! The cache layer only ever reads through [`UserStore::get`]; the write
//! services use the remaining operations, optionally inside a
//! [`UserTransaction`].

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{User, UserPredicate};

/// The source of truth for user records.
///
/// Implementations must be thread-safe (`Send + Sync`) and must enforce
/// uniqueness of username, email and phone at write time, reporting
/// [`StorageError::UniqueViolation`] when a write would break it.
///
/// # Example
///
/// ```ignore
/// use userhub_storage::{StorageError, User, UserStore};
///
/// async fn load(store: &dyn UserStore, username: &str) -> Result<Option<User>, StorageError> {
///     store.get(username).await
/// }
/// ```
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Reads a user by username.
    ///
    /// Returns `None` if the user does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues, not for missing users.
    async fn get(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Returns the first user matching `predicate`, if any.
    async fn find_by(&self, predicate: &UserPredicate) -> Result<Option<User>, StorageError>;

    /// Returns `true` if any user matches `predicate`.
    async fn exists_by(&self, predicate: &UserPredicate) -> Result<bool, StorageError> {
        Ok(self.find_by(predicate).await?.is_some())
    }

    /// Inserts a new user.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::UniqueViolation` if any unique attribute is taken.
    async fn create(&self, user: &User) -> Result<(), StorageError>;

    /// Replaces an existing user, matched by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn update(&self, user: &User) -> Result<(), StorageError>;

    /// Deletes a user by username.
    ///
    /// Returns `true` if a record was removed, `false` if none matched.
    async fn delete(&self, username: &str) -> Result<bool, StorageError>;

    /// Lists users ordered by creation time, returning a page and the total count.
    async fn list(&self, offset: usize, limit: usize) -> Result<(Vec<User>, usize), StorageError>;

    /// Begins a new transaction.
    ///
    /// The transaction must be either committed or rolled back.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::TransactionError` if a transaction cannot be started.
    async fn begin_transaction(&self) -> Result<Box<dyn UserTransaction>, StorageError>;

    /// Returns the name of this storage backend for logging/debugging.
    fn backend_name(&self) -> &'static str;
}

/// A transaction scope for check-then-act sequences.
///
/// Reads inside the transaction see its own uncommitted writes. If an error
/// occurs or `rollback` is called, all writes are discarded.
///
/// # Example
///
/// ```ignore
/// let mut tx = store.begin_transaction().await?;
/// if tx.exists_by(&UserPredicate::Username("alice".into())).await? {
///     tx.rollback().await?;
///     return Err(ServiceError::UsernameExists);
/// }
/// tx.create(&user).await?;
/// tx.commit().await?;
/// ```
#[async_trait]
pub trait UserTransaction: Send + Sync {
    /// Commits all writes in this transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::UniqueViolation` if a concurrent writer took a
    /// unique attribute first, or `StorageError::TransactionError` if the
    /// commit fails.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discards all writes in this transaction.
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;

    /// Returns the first user matching `predicate`, including uncommitted writes.
    async fn find_by(&self, predicate: &UserPredicate) -> Result<Option<User>, StorageError>;

    /// Returns `true` if any user matches `predicate`, including uncommitted writes.
    async fn exists_by(&self, predicate: &UserPredicate) -> Result<bool, StorageError> {
        Ok(self.find_by(predicate).await?.is_some())
    }

    /// Inserts a new user within this transaction.
    ///
    /// See `UserStore::create` for details.
    async fn create(&mut self, user: &User) -> Result<(), StorageError>;
}
