//! Cache-aside wiring for [`User`].

use async_trait::async_trait;
use userhub_storage::{DynUserStore, StorageError, User, UserPredicate};

use crate::backend::DynCache;
use crate::cache_aside::{CacheAsideStore, CacheEntity, EntityLoader};
use crate::ttl::TtlPolicy;

/// Namespace of cached users: `user:info:<username>`.
pub const USER_NAMESPACE: &str = "user:info";

impl CacheEntity for User {
    const NAMESPACE: &'static str = USER_NAMESPACE;

    fn natural_key(&self) -> &str {
        &self.username
    }
}

/// Loads users by username from a [`UserStore`](userhub_storage::UserStore).
#[derive(Clone)]
pub struct StoreLoader {
    store: DynUserStore,
}

impl StoreLoader {
    pub fn new(store: DynUserStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EntityLoader<User> for StoreLoader {
    async fn load(&self, key: &str) -> Result<Option<User>, StorageError> {
        self.store
            .find_by(&UserPredicate::Username(key.to_owned()))
            .await
    }
}

/// Cache-aside store for users.
pub type UserCache = CacheAsideStore<User, StoreLoader>;

pub fn user_cache(cache: DynCache, store: DynUserStore, ttl: TtlPolicy) -> UserCache {
    CacheAsideStore::new(cache, StoreLoader::new(store), ttl)
}
