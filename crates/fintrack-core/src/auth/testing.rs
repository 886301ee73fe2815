//! In-process auth backend and store doubles for unit tests.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::api::{ApiError, AuthBackend, SignUpResponse};
use crate::storage::{KeyValueStore, MemoryStore, StorageError};

use super::manager::SessionManager;
use super::session::{AuthEvent, Session, User};

pub(crate) fn session_expiring_in(secs: i64, access: &str, refresh: &str) -> Session {
    Session {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        expires_at: Utc::now().timestamp() + secs,
        expires_in: Some(secs),
        token_type: "bearer".to_string(),
        user: None,
    }
}

pub(crate) fn manager_with(
    backend: Arc<MockBackend>,
) -> (SessionManager, Arc<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let secrets = Arc::new(MemoryStore::new());
    let manager = SessionManager::new(backend, store.clone(), secrets.clone());
    (manager, store, secrets)
}

/// Poll `check` for up to a second.
pub(crate) async fn wait_until<F, Fut>(check: F) -> bool
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

pub(crate) struct MockBackend {
    events: broadcast::Sender<AuthEvent>,
    issued: AtomicUsize,
    refresh_delay: Duration,
    /// Refresh tokens rotate: each one is accepted once.
    spent_refresh_tokens: Mutex<HashSet<String>>,
    pub refresh_calls: AtomicUsize,
    pub sign_in_calls: AtomicUsize,
    pub sign_up_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
    pub reject_refresh: AtomicBool,
    pub email_confirmed: AtomicBool,
    pub fail_sign_out: AtomicBool,
}

impl MockBackend {
    pub const PASSWORD: &'static str = "correct-horse";

    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events,
            issued: AtomicUsize::new(0),
            refresh_delay: Duration::ZERO,
            spent_refresh_tokens: Mutex::new(HashSet::new()),
            refresh_calls: AtomicUsize::new(0),
            sign_in_calls: AtomicUsize::new(0),
            sign_up_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            reject_refresh: AtomicBool::new(false),
            email_confirmed: AtomicBool::new(true),
            fail_sign_out: AtomicBool::new(false),
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn user(id: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            email: Some(email.to_string()),
            email_confirmed_at: Some(Utc::now()),
            created_at: None,
            user_metadata: serde_json::Value::Null,
        }
    }

    pub fn total_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
            + self.sign_in_calls.load(Ordering::SeqCst)
            + self.sign_up_calls.load(Ordering::SeqCst)
            + self.sign_out_calls.load(Ordering::SeqCst)
    }

    /// Mark `refresh_token` as already rotated away.
    pub fn spend(&self, refresh_token: &str) {
        self.spent_refresh_tokens
            .lock()
            .unwrap()
            .insert(refresh_token.to_string());
    }

    pub fn push(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn issue(&self, user: Option<User>) -> Session {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let mut session = session_expiring_in(3600, &format!("access-{}", n), &format!("refresh-{}", n));
        session.user = user;
        session
    }
}

#[async_trait]
impl AuthBackend for MockBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if password != Self::PASSWORD {
            return Err(ApiError::InvalidCredentials);
        }
        if !self.email_confirmed.load(Ordering::SeqCst) {
            return Err(ApiError::EmailNotConfirmed);
        }
        let session = self.issue(Some(Self::user("u-1", email)));
        self.push(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, _password: &str) -> Result<SignUpResponse, ApiError> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        if self.email_confirmed.load(Ordering::SeqCst) {
            let session = self.issue(Some(Self::user("u-1", email)));
            return Ok(SignUpResponse::Session(session));
        }
        let mut user = Self::user("u-1", email);
        user.email_confirmed_at = None;
        Ok(SignUpResponse::Unconfirmed(user))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let spent = !self
            .spent_refresh_tokens
            .lock()
            .unwrap()
            .insert(refresh_token.to_string());
        if spent || self.reject_refresh.load(Ordering::SeqCst) {
            return Err(ApiError::InvalidRefreshToken(format!(
                "Invalid Refresh Token: {}",
                refresh_token
            )));
        }
        let session = self.issue(None);
        self.push(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), ApiError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("unavailable".into()));
        }
        self.push(AuthEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

/// Store whose every operation fails.
pub(crate) struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Err(io_failure(key))
    }

    async fn set(&self, key: &str, _value: &str) -> Result<(), StorageError> {
        Err(io_failure(key))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        Err(io_failure(key))
    }
}

fn io_failure(key: &str) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
    }
}
