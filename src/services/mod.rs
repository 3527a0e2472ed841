//! Services layer - Business logic
//!
//! Session issue and validation, remember-me tokens, the expiry sweeper,
//! attempt limiting and user lookup. Services coordinate repositories and
//! caches; they know nothing about HTTP.

pub mod auth_token;
pub mod clock;
pub mod password;
pub mod rate_limiter;
pub mod secret;
pub mod session;
pub mod sweeper;
pub mod user;

pub use auth_token::{AuthCookieOutcome, AuthTokenError, AuthTokenManager};
pub use clock::{Clock, DynClock, ManualClock, SystemClock};
pub use password::{hash_password, verify_password};
pub use rate_limiter::{AttemptLimiter, SlidingWindowLimiter};
pub use secret::CookieSigner;
pub use session::{NoopExpiryHook, SessionError, SessionExpiryHook, SessionManager};
pub use sweeper::{ExpirySweeper, SweepFn, SweepReport};
pub use user::{CreateUserInput, LoginInput, UserService, UserServiceError};
