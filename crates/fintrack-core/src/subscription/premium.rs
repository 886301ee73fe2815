use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{ApiError, DataClient};
use crate::auth::SessionManager;

use super::client::SubscriptionClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    LifetimePremium,
    Subscription,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Database,
    SubscriptionService,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PremiumAccess {
    pub has_access: bool,
    pub kind: AccessKind,
    pub source: Option<AccessSource>,
    pub error: Option<String>,
}

impl PremiumAccess {
    fn granted(kind: AccessKind, source: AccessSource) -> Self {
        Self {
            has_access: true,
            kind,
            source: Some(source),
            error: None,
        }
    }

    fn denied() -> Self {
        Self {
            has_access: false,
            kind: AccessKind::None,
            source: None,
            error: None,
        }
    }

    /// No access because a lookup failed; the failure is kept for display.
    fn unverified(error: &ApiError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::denied()
        }
    }
}

/// Resolve the signed-in user's premium access.
///
/// Lifetime grants are checked first, then the subscription service (when
/// configured). Failures never propagate: a failed lookup counts as no grant
/// from that source, and the last failure is recorded in `error`.
pub async fn check_premium_access(
    sessions: &SessionManager,
    data: &DataClient,
    subscriptions: Option<&SubscriptionClient>,
) -> PremiumAccess {
    let Some(session) = sessions.ensure_valid_session().await else {
        debug!("No valid session, no premium access");
        return PremiumAccess::denied();
    };
    let Some(user_id) = session.user_id() else {
        warn!("Session carries no user, no premium access");
        return PremiumAccess::denied();
    };

    let data = data.for_session(Some(&session));
    let mut lifetime_error = None;
    match data.is_lifetime_premium(user_id).await {
        Ok(true) => {
            info!(user_id, "User has lifetime premium access");
            return PremiumAccess::granted(AccessKind::LifetimePremium, AccessSource::Database);
        }
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e, "Lifetime premium lookup failed");
            lifetime_error = Some(e);
        }
    }

    let Some(subscriptions) = subscriptions else {
        debug!("Subscription service not configured");
        return match lifetime_error {
            Some(e) => PremiumAccess::unverified(&e),
            None => PremiumAccess::denied(),
        };
    };

    match subscriptions.customer_info(user_id).await {
        Ok(info) if info.has_active_subscription() => {
            info!(user_id, "User has an active subscription");
            PremiumAccess::granted(AccessKind::Subscription, AccessSource::SubscriptionService)
        }
        Ok(_) => {
            debug!(user_id, "User has no premium access");
            lifetime_error
                .as_ref()
                .map_or_else(PremiumAccess::denied, PremiumAccess::unverified)
        }
        Err(e) => {
            warn!(error = %e, "Subscription lookup failed");
            PremiumAccess::unverified(&e)
        }
    }
}
