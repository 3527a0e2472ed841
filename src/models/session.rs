//! Session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored session row.
///
/// `data` belongs to whoever attached it (the view counter, UI preferences);
/// the session layer persists and forwards it but never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Public half of the session token
    pub id: String,
    /// `None` for anonymous sessions
    pub user_id: Option<i64>,
    /// SHA-256 of the session secret
    #[serde(skip_serializing)]
    pub secret_hash: Vec<u8>,
    /// Absolute expiry; the session is invalid at or after this instant
    pub expires_at: DateTime<Utc>,
    /// Opaque application payload
    pub data: Option<Value>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Check if the session has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

/// Partial update applied by `update_session`.
///
/// `data: Some(None)` clears the payload; `data: None` leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub expires_at: Option<DateTime<Utc>>,
    pub data: Option<Option<Value>>,
}

impl SessionUpdate {
    pub fn expires_at(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            data: None,
        }
    }

    pub fn data(data: Option<Value>) -> Self {
        Self {
            expires_at: None,
            data: Some(data),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.expires_at.is_none() && self.data.is_none()
    }
}

/// A session with its secret material stripped.
///
/// This is what request handlers see and what the expiry hook receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub data: Option<Value>,
}

impl From<&Session> for SessionContext {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            user_id: session.user_id,
            expires_at: session.expires_at,
            data: session.data.clone(),
        }
    }
}

impl From<Session> for SessionContext {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id,
            user_id: session.user_id,
            expires_at: session.expires_at,
            data: session.data,
        }
    }
}

/// Result of issuing a session: the only place the plaintext token exists.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session_id: String,
    /// `"{session_id}.{base64url(secret)}"`
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
