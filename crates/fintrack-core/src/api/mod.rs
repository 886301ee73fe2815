//! REST clients for the hosted backend.
//!
//! - `AuthClient`: sign-in, sign-up, refresh and sign-out against the auth
//!   service; publishes `AuthEvent`s for every session change it observes
//! - `DataClient`: row-level queries against the database REST endpoint
//! - `AuthBackend`: the seam the session manager talks through
//!
//! Every request carries the project's anon key in the `apikey` header;
//! authenticated requests add the session's access token as a bearer token.

pub mod client;
pub mod error;
pub mod rest;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::auth::{AuthEvent, Session, User};

pub use client::AuthClient;
pub use error::ApiError;
pub use rest::{DataClient, UserPermissions};

/// Result of a sign-up call.
#[derive(Debug, Clone, PartialEq)]
pub enum SignUpResponse {
    /// The backend auto-confirmed the account and issued a session.
    Session(Session),
    /// The account exists but the email must be verified before sign-in.
    Unconfirmed(User),
}

/// Remote authentication service as seen by the session manager.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ApiError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResponse, ApiError>;

    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<Session, ApiError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), ApiError>;

    /// Stream of session changes observed by this backend.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
