//! Email verification after sign-up.
//!
//! Until the user clicks the confirmation link, sign-in fails with "email not
//! confirmed". The credentials cached at sign-up let the app retry sign-in on
//! an interval and pick up the session as soon as the address is confirmed.
//! The cache is erased the moment verification succeeds or is cancelled.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::ApiError;

use super::manager::SessionManager;
use super::session::Session;

/// Interval between verification attempts
pub const VERIFICATION_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationStatus {
    Verified(Session),
    Pending,
    NoCredentials,
    Failed(String),
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("No cached credentials - sign up again")]
    NoCredentials,
}

impl SessionManager {
    /// One verification attempt: sign in with the cached credentials.
    pub async fn check_email_verification(&self) -> VerificationStatus {
        let Some(credentials) = self.cached_credentials().await else {
            debug!("No cached credentials for verification");
            return VerificationStatus::NoCredentials;
        };

        match self.sign_in(&credentials.email, &credentials.password).await {
            Ok(session) => {
                self.clear_credentials().await;
                info!(user_id = ?session.user_id(), "Email verified");
                VerificationStatus::Verified(session)
            }
            Err(ApiError::EmailNotConfirmed) => {
                debug!("Email not confirmed yet");
                VerificationStatus::Pending
            }
            Err(e) => {
                warn!(error = %e, "Verification check failed");
                VerificationStatus::Failed(e.to_string())
            }
        }
    }

    /// Poll until the email is verified.
    ///
    /// Runs until verified or the credential cache is gone; bound it with
    /// `tokio::time::timeout` for a deadline.
    pub async fn wait_for_email_verification(
        &self,
        interval: Duration,
    ) -> Result<Session, VerificationError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.check_email_verification().await {
                VerificationStatus::Verified(session) => return Ok(session),
                VerificationStatus::NoCredentials => return Err(VerificationError::NoCredentials),
                VerificationStatus::Pending | VerificationStatus::Failed(_) => {}
            }
        }
    }

    /// Abandon a pending verification and erase the cached credentials.
    pub async fn cancel_email_verification(&self) -> bool {
        self.clear_credentials().await
    }
}
