use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use userhub_storage::{StorageError, User, UserPredicate, UserStore, UserTransaction};
use uuid::Uuid;

/// Storage key is the username.
pub type StorageKey = String;

type UserMap = HashMap<StorageKey, User>;

/// Returns the name of the unique constraint `candidate` would violate, if any.
///
/// `skip_id` excludes the record being replaced during updates.
pub(crate) fn find_conflict<'a>(
    users: impl IntoIterator<Item = &'a User>,
    candidate: &User,
    skip_id: Option<Uuid>,
) -> Option<&'static str> {
    for existing in users {
        if skip_id == Some(existing.id) {
            continue;
        }
        if existing.username == candidate.username {
            return Some("uk_username");
        }
        if candidate.email.is_some() && existing.email == candidate.email {
            return Some("uk_email");
        }
        if existing.phone_country_code == candidate.phone_country_code
            && existing.phone_number == candidate.phone_number
        {
            return Some("uk_phone");
        }
    }
    None
}

/// Operation counters, useful for asserting how often the source of truth was hit.
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    writes: AtomicU64,
    transactions: AtomicU64,
}

impl StoreStats {
    /// Number of `get`/`find_by` calls against committed data.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of successful writes (create/update/delete, including commits).
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of transactions started.
    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }
}

/// In-memory user store.
///
/// This backend provides:
/// - Unique constraints on username, email and phone, checked at write time
/// - Transactions that stage writes and re-check constraints on commit
/// - Operation counters and an optional artificial read latency for tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserStore {
    data: Arc<RwLock<UserMap>>,
    stats: Arc<StoreStats>,
    read_delay: Option<Duration>,
}

impl InMemoryUserStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every committed read by `delay`, widening race windows in tests.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Returns the operation counters.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Returns the number of stored users.
    pub async fn count(&self) -> usize {
        self.data.read().await.len()
    }

    async fn before_read(&self) {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.before_read().await;
        Ok(self.data.read().await.get(username).cloned())
    }

    async fn find_by(&self, predicate: &UserPredicate) -> Result<Option<User>, StorageError> {
        self.before_read().await;
        let guard = self.data.read().await;
        Ok(guard.values().find(|u| u.matches(predicate)).cloned())
    }

    async fn create(&self, user: &User) -> Result<(), StorageError> {
        let mut guard = self.data.write().await;
        if let Some(constraint) = find_conflict(guard.values(), user, None) {
            return Err(StorageError::unique_violation(Some(constraint)));
        }
        guard.insert(user.username.clone(), user.clone());
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(username = %user.username, "user created");
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<(), StorageError> {
        let mut guard = self.data.write().await;
        let previous = guard
            .values()
            .find(|u| u.id == user.id)
            .map(|u| u.username.clone())
            .ok_or_else(|| StorageError::not_found(&user.username))?;

        if let Some(constraint) = find_conflict(guard.values(), user, Some(user.id)) {
            return Err(StorageError::unique_violation(Some(constraint)));
        }

        guard.remove(&previous);
        guard.insert(user.username.clone(), user.clone());
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(username = %user.username, "user updated");
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<bool, StorageError> {
        let removed = self.data.write().await.remove(username).is_some();
        if removed {
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(username = %username, "user deleted");
        }
        Ok(removed)
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<(Vec<User>, usize), StorageError> {
        self.before_read().await;
        let guard = self.data.read().await;
        let mut users: Vec<User> = guard.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let total = users.len();
        let page = users.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn begin_transaction(&self) -> Result<Box<dyn UserTransaction>, StorageError> {
        self.stats.transactions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(InMemoryUserTransaction {
            data: Arc::clone(&self.data),
            stats: Arc::clone(&self.stats),
            staged: Vec::new(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

/// In-memory transaction.
///
/// Writes are staged and applied on commit, where unique constraints are
/// checked again against whatever was committed in the meantime.
pub struct InMemoryUserTransaction {
    data: Arc<RwLock<UserMap>>,
    stats: Arc<StoreStats>,
    staged: Vec<User>,
}

#[async_trait]
impl UserTransaction for InMemoryUserTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut guard = self.data.write().await;
        for user in &self.staged {
            if let Some(constraint) = find_conflict(guard.values(), user, None) {
                return Err(StorageError::unique_violation(Some(constraint)));
            }
        }
        let count = self.staged.len() as u64;
        for user in self.staged {
            guard.insert(user.username.clone(), user);
        }
        self.stats.writes.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        tracing::debug!(staged = self.staged.len(), "transaction rolled back");
        Ok(())
    }

    async fn find_by(&self, predicate: &UserPredicate) -> Result<Option<User>, StorageError> {
        if let Some(user) = self.staged.iter().find(|u| u.matches(predicate)) {
            return Ok(Some(user.clone()));
        }
        let guard = self.data.read().await;
        Ok(guard.values().find(|u| u.matches(predicate)).cloned())
    }

    async fn create(&mut self, user: &User) -> Result<(), StorageError> {
        if let Some(constraint) = find_conflict(&self.staged, user, None) {
            return Err(StorageError::unique_violation(Some(constraint)));
        }
        {
            let guard = self.data.read().await;
            if let Some(constraint) = find_conflict(guard.values(), user, None) {
                return Err(StorageError::unique_violation(Some(constraint)));
            }
        }
        self.staged.push(user.clone());
        Ok(())
    }
}
