//! Workload identity tokens for trusted publishing

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use uuid::Uuid;

/// Audience the package index expects on exchanged tokens
pub const PACKAGE_INDEX_AUDIENCE: &str = "pypi";

/// Default lifetime of a minted token
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 900;

/// A short-lived token minted by the engine for a job instance that
/// declared `permissions: { id_token: write }`.
#[derive(Clone)]
pub struct IdentityToken {
    value: String,
    pub audience: String,
    /// `<workflow>:<job instance>@<ref>`
    pub subject: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdentityToken {
    pub fn mint(audience: &str, subject: &str, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        Self {
            value: format!("sgid.{}", Uuid::new_v4().simple()),
            audience: audience.to_string(),
            subject: subject.to_string(),
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

// never print the token value
impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityToken")
            .field("value", &"***")
            .field("audience", &self.audience)
            .field("subject", &self.subject)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
