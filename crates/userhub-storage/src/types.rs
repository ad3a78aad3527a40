//! Entity types shared by the store, the cache layer and the services.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    /// The account cannot sign in.
    Disabled,
    /// Normal account.
    #[default]
    Active,
}

/// A user record as stored in the source of truth.
///
/// Users are addressed by three natural keys: `username`, `email` (optional)
/// and the `(phone_country_code, phone_number)` pair. All three are unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Surrogate identifier (UUID v7, time ordered).
    pub id: Uuid,
    /// Login name.
    pub username: String,
    /// Opaque password hash produced by the service layer.
    pub password_hash: String,
    /// Email address, if the user gave one.
    #[serde(default)]
    pub email: Option<String>,
    /// Phone country calling code, e.g. `"+86"`.
    pub phone_country_code: String,
    /// Phone number without the country code.
    pub phone_number: String,
    /// Display name.
    #[serde(default)]
    pub nickname: String,
    /// Account status.
    #[serde(default)]
    pub status: UserStatus,
    /// Last successful sign-in.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    /// When the record was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the record was last modified.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    /// Creates a new active user with a fresh identifier.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password_hash: impl Into<String>,
        phone_country_code: impl Into<String>,
        phone_number: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::now_v7(),
            username: username.into(),
            password_hash: password_hash.into(),
            email: None,
            phone_country_code: phone_country_code.into(),
            phone_number: phone_number.into(),
            nickname: String::new(),
            status: UserStatus::Active,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the email address. Empty strings are treated as "no email".
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        let email = email.into();
        self.email = (!email.is_empty()).then_some(email);
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    /// Returns `true` if this record matches the predicate.
    #[must_use]
    pub fn matches(&self, predicate: &UserPredicate) -> bool {
        match predicate {
            UserPredicate::Username(username) => self.username == *username,
            UserPredicate::Email(email) => self.email.as_deref() == Some(email.as_str()),
            UserPredicate::Phone {
                country_code,
                number,
            } => self.phone_country_code == *country_code && self.phone_number == *number,
        }
    }
}

/// Lookup predicate over the unique attributes of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserPredicate {
    /// Match by login name.
    Username(String),
    /// Match by email address.
    Email(String),
    /// Match by full phone number.
    Phone {
        /// Country calling code.
        country_code: String,
        /// Number without the country code.
        number: String,
    },
}

impl UserPredicate {
    /// Short attribute name, used for logging and constraint names.
    #[must_use]
    pub fn attribute(&self) -> &'static str {
        match self {
            Self::Username(_) => "username",
            Self::Email(_) => "email",
            Self::Phone { .. } => "phone",
        }
    }
}
