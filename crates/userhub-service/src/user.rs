//! User write and read services.
//!
//! | Operation         | Lock key                       | Cache handling               |
//! |-------------------|--------------------------------|------------------------------|
//! | `register`        | `lock:user:register:<name>`    | drops any tombstone          |
//! | `create`          | `lock:user:register:<name>`    | drops any tombstone          |
//! | `get`             | none                           | cache-aside read             |
//! | `update_password` | `lock:user:password:<name>`    | double delete                |
//! | `delete`          | none                           | double delete                |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use userhub_cache::{BestEffort, BestEffortExt, Ignorable, LockKey, UserCache};
use userhub_storage::{DynUserStore, StorageError, User, UserPredicate, UserTransaction};

use crate::coordinator::MutationCoordinator;
use crate::error::ServiceError;
use crate::password::PasswordHasher;

/// Input of [`UserService::register`] and [`UserService::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    pub phone_country_code: String,
    pub phone_number: String,
    #[serde(default)]
    pub nickname: String,
}

/// Input of [`UserService::update_password`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePasswordRequest {
    pub username: String,
    pub old_password: String,
    pub new_password: String,
}

/// User operations over the store, the user cache and the consistency protocol.
#[derive(Clone)]
pub struct UserService {
    store: DynUserStore,
    users: Arc<UserCache>,
    coordinator: MutationCoordinator,
    hasher: Arc<dyn PasswordHasher>,
}

impl UserService {
    pub fn new(
        store: DynUserStore,
        users: Arc<UserCache>,
        coordinator: MutationCoordinator,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            store,
            users,
            coordinator,
            hasher,
        }
    }

    /// Self-service sign-up.
    pub async fn register(
        &self,
        req: NewUserRequest,
        cancel: &CancellationToken,
    ) -> Result<User, ServiceError> {
        self.insert("register", req, cancel).await
    }

    /// Administrative creation. Same checks and same lock as
    /// [`register`](Self::register), so the two paths exclude each other.
    pub async fn create(
        &self,
        req: NewUserRequest,
        cancel: &CancellationToken,
    ) -> Result<User, ServiceError> {
        self.insert("create", req, cancel).await
    }

    /// Reads a user through the cache.
    pub async fn get(&self, username: &str, cancel: &CancellationToken) -> Result<User, ServiceError> {
        if username.is_empty() {
            return Err(ServiceError::MissingUsername);
        }
        self.users
            .get(username, cancel)
            .await?
            .ok_or(ServiceError::UserNotFound)
    }

    /// Changes a password after verifying the old one.
    pub async fn update_password(
        &self,
        req: UpdatePasswordRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        if req.username.is_empty() {
            return Err(ServiceError::MissingUsername);
        }

        let lock_key = LockKey::new("user", "password", &req.username);
        self.coordinator
            .guarded(&lock_key, cancel, || self.update_password_locked(&req, cancel))
            .await??;

        tracing::info!(username = %req.username, "Password updated");
        Ok(())
    }

    /// Deletes a user. Returns `false` if there was nothing to delete.
    pub async fn delete(&self, username: &str, cancel: &CancellationToken) -> Result<bool, ServiceError> {
        if username.is_empty() {
            return Err(ServiceError::MissingUsername);
        }

        let cache_key = UserCache::cache_key(username);
        let mutated = self
            .coordinator
            .double_delete(&cache_key, cancel, || async {
                self.store.delete(username).await.map_err(ServiceError::from)
            })
            .await?;

        tracing::info!(username, removed = mutated.value, "User deleted");
        Ok(mutated.value)
    }

    async fn insert(
        &self,
        op: &'static str,
        req: NewUserRequest,
        cancel: &CancellationToken,
    ) -> Result<User, ServiceError> {
        if req.username.is_empty() {
            return Err(ServiceError::MissingUsername);
        }

        // Hashing is slow; keep it out of the lock.
        let password_hash = self.hash_password(req.password.clone()).await?;
        let mut user = User::new(
            req.username.as_str(),
            password_hash,
            req.phone_country_code.as_str(),
            req.phone_number.as_str(),
        )
        .with_nickname(req.nickname.as_str());
        if let Some(email) = req.email.as_deref() {
            user = user.with_email(email);
        }

        // One lock per username for every path that inserts it.
        let lock_key = LockKey::new("user", "register", &user.username);
        self.coordinator
            .guarded(&lock_key, cancel, || async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ServiceError::Cancelled),
                    created = self.create_checked(&user) => created,
                }
            })
            .await??;

        // A lookup before sign-up may have left a tombstone behind.
        let cleared: BestEffort = self
            .users
            .invalidate(&user.username)
            .await
            .map(|_| ())
            .map_err(|e| Ignorable::new("post_create_invalidate", user.username.as_str(), e));
        cleared.or_log();

        tracing::info!(username = %user.username, op, "User created");
        Ok(user)
    }

    async fn create_checked(&self, user: &User) -> Result<(), ServiceError> {
        let mut tx = self.store.begin_transaction().await?;

        if let Err(e) = check_unique(tx.as_ref(), user).await {
            rollback(tx).await;
            return Err(e);
        }

        if let Err(e) = tx.create(user).await {
            rollback(tx).await;
            return Err(self.explain_conflict(e, user).await);
        }

        match tx.commit().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.explain_conflict(e, user).await),
        }
    }

    /// Maps a unique violation that slipped past the checks to the attribute
    /// that caused it by looking at committed data.
    async fn explain_conflict(&self, err: StorageError, user: &User) -> ServiceError {
        if !err.is_unique_violation() {
            tracing::warn!(
                username = %user.username,
                category = %err.category(),
                error = %err,
                "User insert failed"
            );
            return err.into();
        }
        tracing::warn!(username = %user.username, error = %err, "Unique violation despite lock");

        for (predicate, conflict) in unique_predicates(user) {
            if let Ok(true) = self.store.exists_by(&predicate).await {
                return conflict;
            }
        }
        ServiceError::UserExists
    }

    async fn update_password_locked(
        &self,
        req: &UpdatePasswordRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let loaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
            loaded = self.store.get(&req.username) => loaded?,
        };
        let mut user = loaded.ok_or(ServiceError::UserNotFound)?;

        if !self
            .verify_password(req.old_password.clone(), user.password_hash.clone())
            .await?
        {
            return Err(ServiceError::OldPasswordMismatch);
        }
        if req.old_password == req.new_password {
            return Err(ServiceError::NewPasswordSameAsOld);
        }
        self.hasher
            .check_strength(&req.new_password)
            .map_err(ServiceError::WeakPassword)?;

        user.password_hash = self.hash_password(req.new_password.clone()).await?;
        user.updated_at = OffsetDateTime::now_utc();

        let cache_key = UserCache::cache_key(&user.username);
        self.coordinator
            .double_delete(&cache_key, cancel, || async {
                self.store.update(&user).await.map_err(ServiceError::from)
            })
            .await?;
        Ok(())
    }

    async fn hash_password(&self, password: String) -> Result<String, ServiceError> {
        let hasher = Arc::clone(&self.hasher);
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| ServiceError::Password(e.to_string()))?
            .map_err(ServiceError::Password)
    }

    async fn verify_password(&self, password: String, hash: String) -> Result<bool, ServiceError> {
        let hasher = Arc::clone(&self.hasher);
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| ServiceError::Password(e.to_string()))?
            .map_err(ServiceError::Password)
    }
}

fn unique_predicates(user: &User) -> Vec<(UserPredicate, ServiceError)> {
    let mut predicates = vec![(
        UserPredicate::Username(user.username.clone()),
        ServiceError::UsernameExists,
    )];
    if let Some(email) = &user.email {
        predicates.push((UserPredicate::Email(email.clone()), ServiceError::EmailExists));
    }
    predicates.push((
        UserPredicate::Phone {
            country_code: user.phone_country_code.clone(),
            number: user.phone_number.clone(),
        },
        ServiceError::PhoneExists,
    ));
    predicates
}

async fn check_unique(tx: &dyn UserTransaction, user: &User) -> Result<(), ServiceError> {
    for (predicate, conflict) in unique_predicates(user) {
        if tx.exists_by(&predicate).await? {
            return Err(conflict);
        }
    }
    Ok(())
}

async fn rollback(tx: Box<dyn UserTransaction>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Transaction rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use userhub_cache::{DynCache, KvCache, LockOptions, MemoryCache, TtlPolicy, user_cache};
    use userhub_db_memory::InMemoryUserStore;
    use userhub_storage::UserStore;

    use super::*;
    use crate::config::InvalidationConfig;

    /// Stores the password in the clear; keeps tests fast.
    struct PlainHasher;

    impl PasswordHasher for PlainHasher {
        fn hash(&self, password: &str) -> Result<String, String> {
            Ok(format!("plain:{password}"))
        }
        fn verify(&self, password: &str, hash: &str) -> Result<bool, String> {
            Ok(hash.strip_prefix("plain:") == Some(password))
        }
        fn check_strength(&self, password: &str) -> Result<(), String> {
            crate::password::default_strength_policy(password)
        }
    }

    /// A store whose transactions never see existing rows, as if the lock
    /// had expired under a slow request.
    struct BlindChecks {
        inner: Arc<InMemoryUserStore>,
    }

    struct BlindTx(Box<dyn UserTransaction>);

    #[async_trait]
    impl UserTransaction for BlindTx {
        async fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.0.commit().await
        }
        async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
            self.0.rollback().await
        }
        async fn find_by(&self, _: &UserPredicate) -> Result<Option<User>, StorageError> {
            Ok(None)
        }
        async fn create(&mut self, user: &User) -> Result<(), StorageError> {
            self.0.create(user).await
        }
    }

    #[async_trait]
    impl UserStore for BlindChecks {
        async fn get(&self, username: &str) -> Result<Option<User>, StorageError> {
            self.inner.get(username).await
        }
        async fn find_by(&self, predicate: &UserPredicate) -> Result<Option<User>, StorageError> {
            self.inner.find_by(predicate).await
        }
        async fn create(&self, user: &User) -> Result<(), StorageError> {
            self.inner.create(user).await
        }
        async fn update(&self, user: &User) -> Result<(), StorageError> {
            self.inner.update(user).await
        }
        async fn delete(&self, username: &str) -> Result<bool, StorageError> {
            self.inner.delete(username).await
        }
        async fn list(&self, offset: usize, limit: usize) -> Result<(Vec<User>, usize), StorageError> {
            self.inner.list(offset, limit).await
        }
        async fn begin_transaction(&self) -> Result<Box<dyn UserTransaction>, StorageError> {
            Ok(Box::new(BlindTx(self.inner.begin_transaction().await?)))
        }
        fn backend_name(&self) -> &'static str {
            "blind"
        }
    }

    /// Counts deletes of cache entries (lock keys excluded).
    #[derive(Default)]
    struct CountingCache {
        inner: MemoryCache,
        entry_deletes: AtomicUsize,
    }

    #[async_trait]
    impl KvCache for CountingCache {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, userhub_cache::CacheError> {
            self.inner.get(key).await
        }
        async fn set(
            &self,
            key: &str,
            value: &[u8],
            ttl: Duration,
        ) -> Result<(), userhub_cache::CacheError> {
            self.inner.set(key, value, ttl).await
        }
        async fn set_nx(
            &self,
            key: &str,
            value: &[u8],
            ttl: Duration,
        ) -> Result<bool, userhub_cache::CacheError> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool, userhub_cache::CacheError> {
            self.entry_deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key).await
        }
        async fn compare_and_delete(
            &self,
            key: &str,
            expected: &[u8],
        ) -> Result<bool, userhub_cache::CacheError> {
            self.inner.compare_and_delete(key, expected).await
        }
        async fn compare_and_expire(
            &self,
            key: &str,
            expected: &[u8],
            ttl: Duration,
        ) -> Result<bool, userhub_cache::CacheError> {
            self.inner.compare_and_expire(key, expected, ttl).await
        }
        async fn ttl(&self, key: &str) -> Result<Option<Duration>, userhub_cache::CacheError> {
            self.inner.ttl(key).await
        }
        fn backend_name(&self) -> &'static str {
            "counting"
        }
    }

    fn service_over(cache: DynCache, store: DynUserStore) -> UserService {
        let users = Arc::new(user_cache(cache.clone(), store.clone(), TtlPolicy::default()));
        let coordinator =
            MutationCoordinator::new(cache, LockOptions::default(), &InvalidationConfig::default());
        UserService::new(store, users, coordinator, Arc::new(PlainHasher))
    }

    fn alice() -> NewUserRequest {
        NewUserRequest {
            username: "alice".into(),
            password: "Passw0rdOk".into(),
            email: Some("alice@example.com".into()),
            phone_country_code: "+1".into(),
            phone_number: "5550100".into(),
            nickname: "Al".into(),
        }
    }

    #[tokio::test]
    async fn test_register_then_get() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(InMemoryUserStore::new());
        let service = service_over(cache.clone(), store.clone());
        let cancel = CancellationToken::new();

        let created = service.register(alice(), &cancel).await.unwrap();
        assert_eq!(created.password_hash, "plain:Passw0rdOk");
        assert!(cache.get("lock:user:register:alice").await.unwrap().is_none());

        let loaded = service.get("alice", &cancel).await.unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn test_register_reports_each_conflict() {
        let service = service_over(
            Arc::new(MemoryCache::new()),
            Arc::new(InMemoryUserStore::new()),
        );
        let cancel = CancellationToken::new();
        service.register(alice(), &cancel).await.unwrap();

        let same_name = NewUserRequest {
            email: None,
            phone_number: "5550199".into(),
            ..alice()
        };
        assert!(matches!(
            service.register(same_name, &cancel).await,
            Err(ServiceError::UsernameExists)
        ));

        let same_email = NewUserRequest {
            username: "alicia".into(),
            phone_number: "5550199".into(),
            ..alice()
        };
        assert!(matches!(
            service.register(same_email, &cancel).await,
            Err(ServiceError::EmailExists)
        ));

        let same_phone = NewUserRequest {
            username: "alicia".into(),
            email: None,
            ..alice()
        };
        assert!(matches!(
            service.create(same_phone, &cancel).await,
            Err(ServiceError::PhoneExists)
        ));
    }

    #[tokio::test]
    async fn test_register_while_lock_held_is_busy() {
        let cache = Arc::new(MemoryCache::new());
        let service = service_over(cache.clone(), Arc::new(InMemoryUserStore::new()));
        cache
            .set("lock:user:register:alice", b"someone-else", Duration::from_secs(10))
            .await
            .unwrap();

        let err = service
            .register(alice(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_create_waits_on_register_lock() {
        let cache = Arc::new(MemoryCache::new());
        let service = service_over(cache.clone(), Arc::new(InMemoryUserStore::new()));
        cache
            .set("lock:user:register:alice", b"signup-in-progress", Duration::from_secs(10))
            .await
            .unwrap();

        let err = service
            .create(alice(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Busy { ref key } if key == "lock:user:register:alice"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_register_and_create_one_wins() {
        let store = Arc::new(InMemoryUserStore::new());
        let service = service_over(Arc::new(MemoryCache::new()), store.clone());

        let a = {
            let service = service.clone();
            tokio::spawn(async move { service.register(alice(), &CancellationToken::new()).await })
        };
        let b = {
            let service = service.clone();
            tokio::spawn(async move { service.create(alice(), &CancellationToken::new()).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_one_wins() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(InMemoryUserStore::new());
        let service = service_over(cache, store.clone());

        let a = {
            let service = service.clone();
            tokio::spawn(async move { service.register(alice(), &CancellationToken::new()).await })
        };
        let b = {
            let service = service.clone();
            tokio::spawn(async move { service.register(alice(), &CancellationToken::new()).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(ServiceError::UsernameExists) | Err(ServiceError::Busy { .. })
        )));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_unique_violation_at_commit_names_the_attribute() {
        let inner = Arc::new(InMemoryUserStore::new());
        let service = service_over(
            Arc::new(MemoryCache::new()),
            Arc::new(BlindChecks {
                inner: inner.clone(),
            }),
        );
        let cancel = CancellationToken::new();
        service.register(alice(), &cancel).await.unwrap();

        let same_email = NewUserRequest {
            username: "alicia".into(),
            phone_number: "5550199".into(),
            ..alice()
        };
        assert!(matches!(
            service.register(same_email, &cancel).await,
            Err(ServiceError::EmailExists)
        ));
        assert!(matches!(
            service.register(alice(), &cancel).await,
            Err(ServiceError::UsernameExists)
        ));
        assert_eq!(inner.count().await, 1);
    }

    #[tokio::test]
    async fn test_register_clears_tombstone() {
        let cache = Arc::new(MemoryCache::new());
        let service = service_over(cache.clone(), Arc::new(InMemoryUserStore::new()));
        let cancel = CancellationToken::new();

        assert!(matches!(
            service.get("alice", &cancel).await,
            Err(ServiceError::UserNotFound)
        ));
        service.register(alice(), &cancel).await.unwrap();
        assert_eq!(service.get("alice", &cancel).await.unwrap().username, "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_password_invalidates_twice() {
        let cache = Arc::new(CountingCache::default());
        let service = service_over(cache.clone(), Arc::new(InMemoryUserStore::new()));
        let cancel = CancellationToken::new();

        service.register(alice(), &cancel).await.unwrap();
        service.get("alice", &cancel).await.unwrap();
        let before = cache.entry_deletes.load(Ordering::SeqCst);

        service
            .update_password(
                UpdatePasswordRequest {
                    username: "alice".into(),
                    old_password: "Passw0rdOk".into(),
                    new_password: "N3wPassword".into(),
                },
                &cancel,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(cache.entry_deletes.load(Ordering::SeqCst) - before, 2);

        let reloaded = service.get("alice", &cancel).await.unwrap();
        assert_eq!(reloaded.password_hash, "plain:N3wPassword");
    }

    #[tokio::test]
    async fn test_update_password_rejections() {
        let service = service_over(
            Arc::new(MemoryCache::new()),
            Arc::new(InMemoryUserStore::new()),
        );
        let cancel = CancellationToken::new();
        service.register(alice(), &cancel).await.unwrap();

        let attempt = |old: &str, new: &str| UpdatePasswordRequest {
            username: "alice".into(),
            old_password: old.into(),
            new_password: new.into(),
        };

        assert!(matches!(
            service.update_password(attempt("wrong", "N3wPassword"), &cancel).await,
            Err(ServiceError::OldPasswordMismatch)
        ));
        assert!(matches!(
            service.update_password(attempt("Passw0rdOk", "Passw0rdOk"), &cancel).await,
            Err(ServiceError::NewPasswordSameAsOld)
        ));
        assert!(matches!(
            service.update_password(attempt("Passw0rdOk", "weak"), &cancel).await,
            Err(ServiceError::WeakPassword(_))
        ));
        assert!(matches!(
            service
                .update_password(
                    UpdatePasswordRequest {
                        username: "nobody".into(),
                        ..attempt("a", "b")
                    },
                    &cancel
                )
                .await,
            Err(ServiceError::UserNotFound)
        ));
        assert!(matches!(
            service.update_password(UpdatePasswordRequest::default(), &cancel).await,
            Err(ServiceError::MissingUsername)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_second_delete_after_delay() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(InMemoryUserStore::new());
        let service = service_over(cache.clone(), store.clone());
        let cancel = CancellationToken::new();

        let carol = NewUserRequest {
            username: "carol".into(),
            email: None,
            phone_number: "5550123".into(),
            ..alice()
        };
        service.register(carol, &cancel).await.unwrap();
        service.get("carol", &cancel).await.unwrap();
        assert!(cache.get("user:info:carol").await.unwrap().is_some());

        assert!(service.delete("carol", &cancel).await.unwrap());
        assert!(cache.get("user:info:carol").await.unwrap().is_none());

        // A stale entry written in the window is removed by the second delete.
        cache
            .set("user:info:carol", b"stale", Duration::from_secs(300))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(cache.get("user:info:carol").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get("user:info:carol").await.unwrap().is_none());

        assert!(matches!(
            service.get("carol", &cancel).await,
            Err(ServiceError::UserNotFound)
        ));
        assert!(!service.delete("carol", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_username() {
        let service = service_over(
            Arc::new(MemoryCache::new()),
            Arc::new(InMemoryUserStore::new()),
        );
        let cancel = CancellationToken::new();
        assert!(matches!(
            service.get("", &cancel).await,
            Err(ServiceError::MissingUsername)
        ));
        assert!(matches!(
            service.delete("", &cancel).await,
            Err(ServiceError::MissingUsername)
        ));
        assert!(matches!(
            service.register(NewUserRequest::default(), &cancel).await,
            Err(ServiceError::MissingUsername)
        ));
    }
}
