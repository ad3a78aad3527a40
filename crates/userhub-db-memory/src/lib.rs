//! In-memory user store backend for userhub.
//!
//! This crate provides an in-memory implementation of the `UserStore` trait
//! from `userhub-storage`. It enforces the same unique constraints a
//! relational backend would, so the write services can be exercised
//! end-to-end without a database.
//!
//! # Example
//!
//! ```ignore
//! use userhub_db_memory::InMemoryUserStore;
//! use userhub_storage::{User, UserStore};
//!
//! let store = InMemoryUserStore::new();
//! store.create(&User::new("alice", "hash", "+1", "5550100")).await?;
//! ```

pub mod storage;

pub use storage::{InMemoryUserStore, InMemoryUserTransaction, StorageKey, StoreStats};
pub use userhub_storage::{StorageError, User, UserStore};

/// Creates a new shared in-memory store.
pub fn create_user_store() -> userhub_storage::DynUserStore {
    std::sync::Arc::new(InMemoryUserStore::new())
}
