//! Data models
//!
//! Database entities (User, Session, AuthToken) and the values handed across
//! the service boundary.

mod auth_token;
mod session;
mod user;

pub use auth_token::{AuthToken, IssuedAuthToken};
pub use session::{IssuedSession, Session, SessionContext, SessionUpdate};
pub use user::{User, UserRole};
