//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `Session`, `User`, `AuthEvent`: the session model and the changes the
//!   auth service pushes
//! - `SessionManager`: the single source of truth for "is there a usable,
//!   non-expired session", with transparent single-flight refresh
//! - `SessionListener`: owned handle keeping local storage in sync with
//!   auth events
//! - email verification polling with transiently cached credentials
//!
//! Sessions are refreshed when they come within 5 minutes of expiry.

pub mod listener;
pub mod manager;
pub mod session;
pub mod verification;

#[cfg(test)]
pub(crate) mod testing;

pub use listener::SessionListener;
pub use manager::{SessionManager, SignUpOutcome, CREDENTIALS_KEY, SESSION_KEY, USER_INFO_KEY};
pub use session::{AuthEvent, Credentials, Session, User, TOKEN_REFRESH_BUFFER_SECS};
pub use verification::{VerificationError, VerificationStatus};
