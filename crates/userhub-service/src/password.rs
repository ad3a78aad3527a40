//! Password hashing.
//!
//! The services only see the [`PasswordHasher`] trait. [`Argon2Hasher`]
//! stores Argon2id hashes in PHC string format with a random salt per hash.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{
    PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};

/// Hashes, verifies and vets passwords.
///
/// Implementations are synchronous and may be CPU heavy; callers run them
/// on the blocking pool.
pub trait PasswordHasher: Send + Sync {
    /// Returns a self-describing hash of `password`.
    fn hash(&self, password: &str) -> Result<String, String>;

    /// Checks `password` against a hash produced by [`hash`](Self::hash).
    /// `Err` means the stored hash is unreadable.
    fn verify(&self, password: &str, hash: &str) -> Result<bool, String>;

    /// Rejects passwords that do not meet the policy.
    fn check_strength(&self, password: &str) -> Result<(), String>;
}

const MIN_LENGTH: usize = 8;
const MAX_LENGTH: usize = 32;

/// Length 8-32 with at least one digit, one upper and one lower case letter.
pub fn default_strength_policy(password: &str) -> Result<(), String> {
    let len = password.chars().count();
    if len < MIN_LENGTH {
        return Err(format!("must be at least {MIN_LENGTH} characters"));
    }
    if len > MAX_LENGTH {
        return Err(format!("must be at most {MAX_LENGTH} characters"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("must contain a digit".into());
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("must contain an upper case letter".into());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err("must contain a lower case letter".into());
    }
    Ok(())
}

/// Argon2id hasher.
#[derive(Clone, Default)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl Argon2Hasher {
    /// Argon2id with the crate's default cost parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Argon2id with explicit cost parameters (memory in KiB, iterations, lanes).
    pub fn with_params(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self, String> {
        let params = Params::new(m_cost, t_cost, p_cost, None).map_err(|e| e.to_string())?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| e.to_string())?;
        Ok(hash.to_string())
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool, String> {
        let parsed = PasswordHash::new(hash).map_err(|e| e.to_string())?;
        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    fn check_strength(&self, password: &str) -> Result<(), String> {
        default_strength_policy(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> Argon2Hasher {
        Argon2Hasher::with_params(1024, 1, 1).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = cheap();
        let hash = hasher.hash("Secret123").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("Secret123", &hash).unwrap());
        assert!(!hasher.verify("Secret124", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let hasher = cheap();
        assert_ne!(
            hasher.hash("Secret123").unwrap(),
            hasher.hash("Secret123").unwrap()
        );
    }

    #[test]
    fn test_unreadable_hash_is_an_error() {
        assert!(cheap().verify("Secret123", "not-a-phc-string").is_err());
    }

    #[test]
    fn test_strength_policy() {
        assert!(default_strength_policy("Passw0rdOk").is_ok());
        assert!(default_strength_policy("Sh0rt").is_err());
        assert!(default_strength_policy("alllowercase1").is_err());
        assert!(default_strength_policy("ALLUPPERCASE1").is_err());
        assert!(default_strength_policy("NoDigitsHere").is_err());
        assert!(default_strength_policy(&"Aa1".repeat(20)).is_err());
    }
}
