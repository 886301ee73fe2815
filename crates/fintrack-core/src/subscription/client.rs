use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::api::ApiError;

/// Default base URL of the subscription service REST API
pub const DEFAULT_BASE_URL: &str = "https://api.revenuecat.com";

/// Store product id of the monthly plan
pub const PRODUCT_MONTHLY: &str = "PIAMonthly";

/// Store product id of the annual plan
pub const PRODUCT_ANNUAL: &str = "PIAYearly";

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Entitlement {
    #[serde(default)]
    pub product_identifier: Option<String>,
    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,
    /// `None` for non-expiring entitlements
    #[serde(default)]
    pub expires_date: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_date.map(|expires| expires > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomerInfo {
    #[serde(default)]
    pub original_app_user_id: Option<String>,
    #[serde(default)]
    pub entitlements: HashMap<String, Entitlement>,
}

impl CustomerInfo {
    /// Names of entitlements active at `now`, sorted
    pub fn active_entitlements_at(&self, now: DateTime<Utc>) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entitlements
            .iter()
            .filter(|(_, e)| e.is_active_at(now))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Any active entitlement grants premium access.
    pub fn has_active_subscription(&self) -> bool {
        !self.active_entitlements_at(Utc::now()).is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct SubscriberResponse {
    subscriber: CustomerInfo,
}

/// Client for the subscription service.
#[derive(Clone)]
pub struct SubscriptionClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SubscriptionClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Subscription state of the customer identified by `app_user_id`.
    pub async fn customer_info(&self, app_user_id: &str) -> Result<CustomerInfo, ApiError> {
        let url = format!("{}/v1/subscribers/{}", self.base_url, app_user_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        let parsed: SubscriberResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("subscriber response: {}", e)))?;
        debug!(
            entitlements = parsed.subscriber.entitlements.len(),
            "Fetched customer info"
        );
        Ok(parsed.subscriber)
    }
}
