//! Wiring of the cache, store and services from an [`AppConfig`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use userhub_cache::{ConnectError, DynCache, MemoryCache, UserCache, connect_redis, user_cache};
use userhub_storage::DynUserStore;

use crate::config::AppConfig;
use crate::coordinator::MutationCoordinator;
use crate::password::{Argon2Hasher, PasswordHasher};
use crate::user::UserService;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<AppConfig>,
    pub cache: DynCache,
    pub store: DynUserStore,
    pub users: Arc<UserCache>,
    pub coordinator: MutationCoordinator,
    pub user_service: UserService,
}

impl ServiceContext {
    /// Connects to Redis with retry and wires the services over `store`.
    pub async fn connect(
        config: AppConfig,
        store: DynUserStore,
        cancel: &CancellationToken,
    ) -> Result<Self, ContextError> {
        config.validate().map_err(ContextError::Config)?;
        let cache = connect_redis(&config.redis, cancel).await?;
        tracing::info!(url = %config.redis.url, "Redis cache connected");
        Self::with_cache(config, cache, store)
    }

    /// Single-instance setup over an in-process cache.
    pub fn in_memory(config: AppConfig, store: DynUserStore) -> Result<Self, ContextError> {
        Self::with_cache(config, Arc::new(MemoryCache::new()), store)
    }

    /// Wires the services over an existing cache, hashing with Argon2id.
    pub fn with_cache(
        config: AppConfig,
        cache: DynCache,
        store: DynUserStore,
    ) -> Result<Self, ContextError> {
        Self::with_hasher(config, cache, store, Arc::new(Argon2Hasher::new()))
    }

    pub fn with_hasher(
        config: AppConfig,
        cache: DynCache,
        store: DynUserStore,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Result<Self, ContextError> {
        config.validate().map_err(ContextError::Config)?;

        let users = Arc::new(user_cache(
            cache.clone(),
            store.clone(),
            config.cache.policy(),
        ));
        let coordinator =
            MutationCoordinator::new(cache.clone(), config.lock.options(), &config.invalidation);
        let user_service = UserService::new(
            store.clone(),
            users.clone(),
            coordinator.clone(),
            hasher,
        );

        tracing::debug!(
            cache = cache.backend_name(),
            store = store.backend_name(),
            "Service context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            cache,
            store,
            users,
            coordinator,
            user_service,
        })
    }
}

#[cfg(test)]
mod tests {
    use userhub_cache::RedisConfig;
    use userhub_db_memory::create_user_store;

    use super::*;
    use crate::user::NewUserRequest;

    #[tokio::test]
    async fn test_in_memory_context_serves_users() {
        let ctx = ServiceContext::in_memory(AppConfig::default(), create_user_store()).unwrap();
        let cancel = CancellationToken::new();

        let fast = ServiceContext::with_hasher(
            (*ctx.config).clone(),
            ctx.cache.clone(),
            ctx.store.clone(),
            Arc::new(Argon2Hasher::with_params(1024, 1, 1).unwrap()),
        )
        .unwrap();

        fast.user_service
            .register(
                NewUserRequest {
                    username: "dave".into(),
                    password: "Passw0rdOk".into(),
                    email: None,
                    phone_country_code: "+1".into(),
                    phone_number: "5550144".into(),
                    nickname: String::new(),
                },
                &cancel,
            )
            .await
            .unwrap();

        let dave = ctx.user_service.get("dave", &cancel).await.unwrap();
        assert!(dave.password_hash.starts_with("$argon2id$"));
        assert_eq!(ctx.cache.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = AppConfig {
            redis: RedisConfig {
                pool_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = ServiceContext::in_memory(config, create_user_store())
            .err()
            .unwrap();
        assert!(matches!(err, ContextError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ServiceContext::connect(AppConfig::default(), create_user_store(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ContextError::Connect(ConnectError::Cancelled)));
    }
}
