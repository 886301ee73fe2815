//! Common test utilities for integration tests against a mock backend

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fintrack_core::storage::MemoryStore;
use fintrack_core::{AppContext, BackendConfig, Session};
use serde_json::{json, Value};
use wiremock::MockServer;

pub const ANON_KEY: &str = "anon-test-key";
pub const REVENUECAT_KEY: &str = "rc-test-key";
pub const USER_ID: &str = "7f0c2c4e-5a1b-4b1e-9c55-1f2f3a4b5c6d";

/// Backend settings pointing every service at the mock server
pub fn backend_config(server: &MockServer, with_subscriptions: bool) -> BackendConfig {
    BackendConfig {
        supabase_url: server.uri(),
        supabase_anon_key: ANON_KEY.to_string(),
        revenuecat_api_key: with_subscriptions.then(|| REVENUECAT_KEY.to_string()),
        revenuecat_base_url: server.uri(),
        refresh_margin_secs: 300,
    }
}

/// Context with in-memory stores, returned alongside the stores
pub fn memory_context(
    server: &MockServer,
    with_subscriptions: bool,
) -> (AppContext, Arc<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let secrets = Arc::new(MemoryStore::new());
    let ctx = AppContext::with_stores(
        &backend_config(server, with_subscriptions),
        store.clone(),
        secrets.clone(),
    )
    .expect("context");
    (ctx, store, secrets)
}

pub fn user_json(email: &str) -> Value {
    json!({
        "id": USER_ID,
        "email": email,
        "email_confirmed_at": "2025-07-06T12:00:00Z",
        "created_at": "2025-07-06T11:58:00Z",
        "user_metadata": {}
    })
}

/// Token endpoint response as the auth service returns it
pub fn token_json(access: &str, refresh: &str, expires_in: i64) -> Value {
    json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": expires_in,
        "expires_at": Utc::now().timestamp() + expires_in,
        "refresh_token": refresh,
        "user": user_json("saver@example.com")
    })
}

pub fn session(access: &str, refresh: &str, expires_in: i64) -> Session {
    serde_json::from_value(token_json(access, refresh, expires_in)).expect("session")
}

pub fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Poll `check` every 10ms for up to a second.
pub async fn wait_until<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
