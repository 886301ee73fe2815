//! Subscription state and premium access.
//!
//! Premium features are unlocked either by a lifetime grant stored in the
//! `user_permissions` table or by an active subscription entitlement from
//! the in-app-purchase service. The session supplies the user id both
//! lookups are keyed by.

pub mod client;
pub mod premium;

pub use client::{CustomerInfo, Entitlement, SubscriptionClient, PRODUCT_ANNUAL, PRODUCT_MONTHLY};
pub use premium::{check_premium_access, AccessKind, AccessSource, PremiumAccess};
