//! Remember-me token model

use chrono::{DateTime, Utc};

/// A stored remember-me token row.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub user_id: i64,
    /// Random, indexed; locates the row without revealing the secret
    pub lookup: String,
    /// SHA-256 of the secret segment
    pub token_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of issuing or rotating a remember-me token.
#[derive(Debug, Clone)]
pub struct IssuedAuthToken {
    /// `"{lookup}.{base64url(secret)}.{base64url(user_uuid)}"`
    pub token: String,
    pub lookup: String,
    pub expires_at: DateTime<Utc>,
}
