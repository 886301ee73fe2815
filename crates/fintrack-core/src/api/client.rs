//! API client for the hosted authentication service.
//!
//! This module provides the `AuthClient` struct, which implements
//! `AuthBackend` over the service's REST endpoints and publishes an
//! `AuthEvent` for every session change it performs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{AuthEvent, Session, User};

use super::{ApiError, AuthBackend, SignUpResponse};

// ============================================================================
// Constants
// ============================================================================

/// Path prefix of the auth service below the project URL
const AUTH_PATH: &str = "/auth/v1";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Capacity of the auth event channel. Slow listeners past this lag and
/// skip to the newest events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    token_type: Option<String>,
    user: Option<User>,
}

impl TokenResponse {
    fn into_session(self) -> Result<Session, ApiError> {
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("token response without refresh token".into()))?;

        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| Utc::now().timestamp() + secs))
            .ok_or_else(|| ApiError::InvalidResponse("token response without expiry".into()))?;

        Ok(Session {
            access_token: self.access_token,
            refresh_token,
            expires_at,
            expires_in: self.expires_in,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            user: self.user,
        })
    }
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

/// Fields accepted by the user update endpoint. `None` leaves a field alone.
#[derive(Debug, Default, Clone, Serialize)]
pub struct UserAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Client for the auth service.
/// Clone is cheap - reqwest::Client and the event sender are both shared handles.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
    anon_key: String,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthClient {
    /// Create a client for the project at `project_url`
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self::with_client(client, project_url, anon_key))
    }

    /// Create a client sharing an existing connection pool.
    pub fn with_client(client: Client, project_url: &str, anon_key: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            base_url: format!("{}{}", project_url.trim_end_matches('/'), AUTH_PATH),
            anon_key: anon_key.to_string(),
            events,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn publish(&self, event: AuthEvent) {
        let kind = event.kind();
        // No receivers is fine; nobody is listening yet.
        if self.events.send(event).is_err() {
            debug!(event = kind, "No auth event subscribers");
        } else {
            debug!(event = kind, "Published auth event");
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn token_grant<B: Serialize>(&self, grant_type: &str, body: &B) -> Result<Session, ApiError> {
        let response = self
            .client
            .post(self.url("/token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("token response: {}", e)))?;
        token.into_session()
    }

    async fn post_logout(&self, access_token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url("/logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// Fetch the user that owns `access_token`
    pub async fn get_user(&self, access_token: &str) -> Result<User, ApiError> {
        let response = self
            .client
            .get(self.url("/user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("user response: {}", e)))
    }

    /// Update email, password or metadata of the signed-in user
    pub async fn update_user(
        &self,
        access_token: &str,
        attributes: &UserAttributes,
    ) -> Result<User, ApiError> {
        let response = self
            .client
            .put(self.url("/user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .json(attributes)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let user: User = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("user response: {}", e)))?;

        info!(user_id = %user.id, "User updated");
        self.publish(AuthEvent::UserUpdated(user.clone()));
        Ok(user)
    }
}

#[async_trait]
impl AuthBackend for AuthClient {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let session = self
            .token_grant("password", &PasswordGrant { email, password })
            .await?;

        info!(user_id = ?session.user_id(), "Signed in");
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResponse, ApiError> {
        let response = self
            .client
            .post(self.url("/signup"))
            .header("apikey", &self.anon_key)
            .json(&PasswordGrant { email, password })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let mut body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("signup response: {}", e)))?;

        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)
                .map_err(|e| ApiError::InvalidResponse(format!("signup session: {}", e)))?;
            let session = token.into_session()?;
            info!(user_id = ?session.user_id(), "Signed up and signed in");
            self.publish(AuthEvent::SignedIn(session.clone()));
            return Ok(SignUpResponse::Session(session));
        }

        // Unconfirmed sign-ups return the bare user, sometimes wrapped.
        if body.get("id").is_none() {
            if let Some(user) = body.get_mut("user").map(serde_json::Value::take) {
                body = user;
            }
        }
        let user: User = serde_json::from_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("signup user: {}", e)))?;
        info!(user_id = %user.id, "Signed up, email confirmation pending");
        Ok(SignUpResponse::Unconfirmed(user))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, ApiError> {
        let session = self
            .token_grant("refresh_token", &RefreshGrant { refresh_token })
            .await?;

        debug!(expires_at = session.expires_at, "Token refreshed");
        self.publish(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), ApiError> {
        match self.post_logout(access_token).await {
            Ok(()) => {}
            // The token is already dead server-side; that is a sign-out too.
            Err(ApiError::Unauthorized) | Err(ApiError::NotFound(_)) => {
                warn!("Sign-out with an already invalid token");
            }
            Err(e) => return Err(e),
        }

        info!("Signed out");
        self.publish(AuthEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}
