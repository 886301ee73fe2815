//! fintrack core library.
//!
//! Client-side session lifecycle for the fintrack personal-finance app: the
//! persisted session and its refresh, the auth event listener, email
//! verification after sign-up, and the REST clients for the hosted auth,
//! database and subscription services.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod storage;
pub mod subscription;

pub use api::{ApiError, AuthBackend, AuthClient, DataClient};
pub use auth::{AuthEvent, Session, SessionListener, SessionManager, User};
pub use config::{BackendConfig, Config};
pub use context::AppContext;
