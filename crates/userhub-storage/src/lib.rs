//! # userhub-storage
//!
//! Store abstraction for the userhub service.
//!
//! This crate defines the user entity and the traits every storage backend
//! implements. It does not contain any implementations; the in-memory
//! backend lives in `userhub-db-memory`.
//!
//! ## Overview
//!
//! - [`UserStore`]: reads, writes and uniqueness lookups against the source
//!   of truth.
//! - [`UserTransaction`]: a check-then-act scope used by the write services.
//! - [`User`] / [`UserPredicate`]: the entity and its unique attributes.

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{UserStore, UserTransaction};
pub use types::{User, UserPredicate, UserStatus};

/// Type alias for a shared store trait object.
pub type DynUserStore = std::sync::Arc<dyn UserStore>;
