//! Premium access resolution against mock database and subscription services.

mod common;

use std::time::Duration;

use common::{can_bind_localhost, memory_context, session, ANON_KEY, REVENUECAT_KEY, USER_ID};
use fintrack_core::subscription::{AccessKind, AccessSource};
use fintrack_core::DataClient;
use serde_json::json;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn no_row() -> ResponseTemplate {
    ResponseTemplate::new(406).set_body_json(json!({
        "code": "PGRST116",
        "details": "The result contains 0 rows",
        "hint": null,
        "message": "JSON object requested, multiple (or no) rows returned"
    }))
}

async fn mount_permissions(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/user_permissions"))
        .and(query_param("user_id", format!("eq.{}", USER_ID)))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_subscriber(server: &MockServer, entitlements: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/v1/subscribers/{}", USER_ID)))
        .and(header("authorization", format!("Bearer {}", REVENUECAT_KEY).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "request_date": "2025-07-06T12:00:00Z",
            "subscriber": {
                "original_app_user_id": USER_ID,
                "entitlements": entitlements
            }
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_lifetime_grant_wins() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_permissions(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "user_id": USER_ID,
            "is_lifetime_premium": true,
            "granted_by": "support",
            "notes": "beta tester"
        })),
    )
    .await;
    let (ctx, _, _) = memory_context(&server, true);
    ctx.sessions
        .save_session(&session("access-1", "refresh-1", 3600))
        .await;

    let access = ctx.premium_access().await;
    assert!(access.has_access);
    assert_eq!(access.kind, AccessKind::LifetimePremium);
    assert_eq!(access.source, Some(AccessSource::Database));
}

#[tokio::test]
async fn test_missing_row_falls_through_to_subscription() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_permissions(&server, no_row()).await;
    mount_subscriber(
        &server,
        json!({
            "premium": {
                "product_identifier": "PIAYearly",
                "purchase_date": "2025-07-01T00:00:00Z",
                "expires_date": "2999-07-01T00:00:00Z"
            }
        }),
    )
    .await;
    let (ctx, _, _) = memory_context(&server, true);
    ctx.sessions
        .save_session(&session("access-1", "refresh-1", 3600))
        .await;

    let access = ctx.premium_access().await;
    assert!(access.has_access);
    assert_eq!(access.kind, AccessKind::Subscription);
    assert_eq!(access.source, Some(AccessSource::SubscriptionService));
}

#[tokio::test]
async fn test_expired_subscription_denies_access() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_permissions(&server, no_row()).await;
    mount_subscriber(
        &server,
        json!({
            "premium": {
                "product_identifier": "PIAMonthly",
                "expires_date": "2020-01-01T00:00:00Z"
            }
        }),
    )
    .await;
    let (ctx, _, _) = memory_context(&server, true);
    ctx.sessions
        .save_session(&session("access-1", "refresh-1", 3600))
        .await;

    let access = ctx.premium_access().await;
    assert!(!access.has_access);
    assert_eq!(access.kind, AccessKind::None);
    assert_eq!(access.error, None);
}

#[tokio::test]
async fn test_subscription_failure_is_reported_not_raised() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_permissions(&server, no_row()).await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/subscribers/{}", USER_ID)))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(&server)
        .await;
    let (ctx, _, _) = memory_context(&server, true);
    ctx.sessions
        .save_session(&session("access-1", "refresh-1", 3600))
        .await;

    let access = ctx.premium_access().await;
    assert!(!access.has_access);
    assert_eq!(access.kind, AccessKind::None);
    assert_eq!(access.source, None);
    assert!(access.error.is_some());
}

#[tokio::test]
async fn test_failed_lifetime_lookup_counts_as_no_grant() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_permissions(
        &server,
        ResponseTemplate::new(500).set_body_json(json!({"message": "database unavailable"})),
    )
    .await;
    let (ctx, _, _) = memory_context(&server, false);
    ctx.sessions
        .save_session(&session("access-1", "refresh-1", 3600))
        .await;

    let access = ctx.premium_access().await;
    assert!(!access.has_access);
    assert_eq!(access.kind, AccessKind::None);
    assert!(access
        .error
        .as_deref()
        .is_some_and(|e| e.contains("database unavailable")));
}

#[tokio::test]
async fn test_signed_out_user_has_no_access() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    let (ctx, _, _) = memory_context(&server, true);

    let access = ctx.premium_access().await;
    assert!(!access.has_access);
    assert_eq!(access.kind, AccessKind::None);
}

#[tokio::test]
async fn test_rate_limited_query_is_retried() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/user_permissions"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/user_permissions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": USER_ID,
            "is_lifetime_premium": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let data = DataClient::new(&server.uri(), ANON_KEY)
        .unwrap()
        .with_initial_backoff(Duration::from_millis(10));

    let row = data.user_permissions(USER_ID).await.unwrap().expect("row");
    assert!(!row.is_lifetime_premium);
}

#[tokio::test]
async fn test_grant_lifetime_premium_upserts() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/user_permissions"))
        .and(query_param("on_conflict", "user_id"))
        .and(header_exists("prefer"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "user_id": USER_ID,
            "is_lifetime_premium": true,
            "granted_by": "support",
            "notes": "refund goodwill"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let data = DataClient::new(&server.uri(), ANON_KEY)
        .unwrap()
        .with_token("service-token".to_string());

    let row = data
        .grant_lifetime_premium(USER_ID, "support", "refund goodwill")
        .await
        .unwrap();
    assert!(row.is_lifetime_premium);
    assert_eq!(row.granted_by.as_deref(), Some("support"));
}
