//! Row-level REST queries against the hosted database.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::Session;

use super::client::REQUEST_TIMEOUT_SECS;
use super::ApiError;

/// Path prefix of the REST endpoint below the project URL
const REST_PATH: &str = "/rest/v1";

/// Media type asking for exactly one row as a JSON object
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Error code for a single-row request that matched zero (or several) rows
const NO_SINGLE_ROW: &str = "PGRST116";

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Premium grants stored per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPermissions {
    pub user_id: String,
    #[serde(default)]
    pub is_lifetime_premium: bool,
    #[serde(default)]
    pub granted_by: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RestErrorBody {
    code: Option<String>,
}

/// REST client for database tables.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct DataClient {
    client: Client,
    base_url: String,
    anon_key: String,
    token: Option<String>,
    initial_backoff: Duration,
}

impl DataClient {
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}{}", project_url.trim_end_matches('/'), REST_PATH),
            anon_key: anon_key.to_string(),
            token: None,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Create a new DataClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            anon_key: self.anon_key.clone(),
            token: Some(token),
            initial_backoff: self.initial_backoff,
        }
    }

    /// Client acting as the session's user, or anonymously without one.
    pub fn for_session(&self, session: Option<&Session>) -> Self {
        match session {
            Some(session) => self.with_token(session.access_token.clone()),
            None => Self {
                token: None,
                ..self.clone()
            },
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Shorten the rate-limit backoff (tests).
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let bearer = self.token.as_deref().unwrap_or(&self.anon_key);
        let invalid = |_| ApiError::InvalidResponse("credential is not a valid header value".into());

        let mut headers = header::HeaderMap::new();
        headers.insert("apikey", header::HeaderValue::from_str(&self.anon_key).map_err(invalid)?);
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", bearer)).map_err(invalid)?,
        );
        Ok(headers)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    /// Send a request, retrying while the server answers 429.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = build().headers(self.auth_headers()?).send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }

    /// Fetch exactly one row, or `None` when no single row matches.
    async fn select_single<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Option<T>, ApiError> {
        let url = self.table_url(table);
        let response = self
            .send_with_retry(|| {
                self.client
                    .get(&url)
                    .query(&[("select", "*")])
                    .query(filters)
                    .header(header::ACCEPT, SINGLE_OBJECT)
            })
            .await?;

        let status = response.status();
        if status.is_success() {
            let row = response
                .json()
                .await
                .map_err(|e| ApiError::InvalidResponse(format!("{} row: {}", table, e)))?;
            return Ok(Some(row));
        }

        let body = response.text().await.unwrap_or_default();
        let code = serde_json::from_str::<RestErrorBody>(&body)
            .ok()
            .and_then(|b| b.code);
        if code.as_deref() == Some(NO_SINGLE_ROW) {
            debug!(table, "No single row matched");
            return Ok(None);
        }
        Err(ApiError::from_status(status, &body))
    }

    /// Permissions row for `user_id`, if any
    pub async fn user_permissions(&self, user_id: &str) -> Result<Option<UserPermissions>, ApiError> {
        self.select_single("user_permissions", &[("user_id", format!("eq.{}", user_id))])
            .await
    }

    pub async fn is_lifetime_premium(&self, user_id: &str) -> Result<bool, ApiError> {
        Ok(self
            .user_permissions(user_id)
            .await?
            .map(|p| p.is_lifetime_premium)
            .unwrap_or(false))
    }

    /// Grant lifetime premium to `user_id`, creating or updating its row.
    pub async fn grant_lifetime_premium(
        &self,
        user_id: &str,
        granted_by: &str,
        notes: &str,
    ) -> Result<UserPermissions, ApiError> {
        let row = UserPermissions {
            user_id: user_id.to_string(),
            is_lifetime_premium: true,
            granted_by: Some(granted_by.to_string()),
            notes: Some(notes.to_string()),
            updated_at: Some(Utc::now()),
        };

        let url = self.table_url("user_permissions");
        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .query(&[("on_conflict", "user_id")])
                    .header("Prefer", "resolution=merge-duplicates,return=representation")
                    .header(header::ACCEPT, SINGLE_OBJECT)
                    .json(&row)
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("user_permissions row: {}", e)))
    }
}
