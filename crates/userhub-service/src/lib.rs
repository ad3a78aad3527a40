//! # userhub-service
//!
//! User write services on top of `userhub-cache`: registration and admin
//! creation under per-username locks, password changes and deletes through
//! the double-delete protocol, and cache-aside reads.
//!
//! [`ServiceContext`] wires everything from an [`AppConfig`] loaded with
//! [`config::loader::load_config`].

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod observability;
pub mod password;
pub mod user;

pub use config::{AppConfig, InvalidationConfig, LoggingConfig};
pub use context::{ContextError, ServiceContext};
pub use coordinator::{Mutated, MutationCoordinator};
pub use error::{MutationError, ServiceError};
pub use observability::{apply_logging_level, init_observability, init_tracing};
pub use password::{Argon2Hasher, PasswordHasher, default_strength_policy};
pub use user::{NewUserRequest, UpdatePasswordRequest, UserService};
