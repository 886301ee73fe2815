//! Session store and validator.
//!
//! `SessionManager` owns the persisted copy of the session. The auth service
//! owns the canonical one; the local copy is a cache reconciled through
//! refreshes and pushed `AuthEvent`s.
//!
//! None of the session operations raise for expected conditions. Absence,
//! expiry, storage failures and refresh failures all collapse to `None` (or
//! `false`) after being logged, so callers only ever decide between "have a
//! session" and "send the user to sign in".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, AuthBackend, SignUpResponse};
use crate::storage::{KeyValueStore, StorageError};

use super::listener::ListenerTask;
use super::session::{AuthEvent, Credentials, Session, User, TOKEN_REFRESH_BUFFER_SECS};

/// Storage key of the persisted session
pub const SESSION_KEY: &str = "user_session";

/// Storage key of the cached user info
pub const USER_INFO_KEY: &str = "user_info";

/// Storage key of the credentials cached during email verification
pub const CREDENTIALS_KEY: &str = "user_credentials";

type RefreshFuture = Shared<BoxFuture<'static, Option<Session>>>;

/// A refresh in progress, shared by every caller holding the same refresh token.
struct InFlightRefresh {
    refresh_token: String,
    future: RefreshFuture,
}

struct Inner {
    backend: Arc<dyn AuthBackend>,
    store: Arc<dyn KeyValueStore>,
    secrets: Arc<dyn KeyValueStore>,
    in_flight: Mutex<Option<InFlightRefresh>>,
    /// Bumped whenever local state is erased; refreshes started under an
    /// older value must not write back.
    epoch: AtomicU64,
    listener: Mutex<Weak<ListenerTask>>,
}

/// Outcome of a sign-up.
#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    /// Account confirmed immediately; the session has been persisted.
    SignedIn(Session),
    /// Email verification is required. Credentials are cached until the
    /// verification flow ends.
    VerificationPending(User),
}

/// Session lifecycle manager.
/// Clone is cheap - all state lives behind one `Arc`.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
    refresh_margin: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionManager {
    /// `store` holds the session and user info; `secrets` holds the
    /// credentials cached during email verification.
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        store: Arc<dyn KeyValueStore>,
        secrets: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                secrets,
                in_flight: Mutex::new(None),
                epoch: AtomicU64::new(0),
                listener: Mutex::new(Weak::new()),
            }),
            refresh_margin: Duration::seconds(TOKEN_REFRESH_BUFFER_SECS),
        }
    }

    /// Override how close to expiry `ensure_valid_session` starts refreshing.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    pub(crate) fn backend(&self) -> &Arc<dyn AuthBackend> {
        &self.inner.backend
    }

    pub(crate) fn listener_slot(&self) -> MutexGuard<'_, Weak<ListenerTask>> {
        lock(&self.inner.listener)
    }

    // ===== Storage helpers =====

    async fn read_json<T: DeserializeOwned>(
        store: &dyn KeyValueStore,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Malformed {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize + Sync>(
        store: &dyn KeyValueStore,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|source| StorageError::Malformed {
            key: key.to_string(),
            source,
        })?;
        store.set(key, &raw).await
    }

    /// Persisted session without any expiry handling.
    async fn load_session(&self) -> Option<Session> {
        match Self::read_json(&*self.inner.store, SESSION_KEY).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Failed to get session");
                None
            }
        }
    }

    // ===== Session lifecycle =====

    /// Persist `session`, overwriting any prior value.
    ///
    /// Returns `false` (and logs) when the write fails.
    pub async fn save_session(&self, session: &Session) -> bool {
        match Self::write_json(&*self.inner.store, SESSION_KEY, session).await {
            Ok(()) => {
                debug!(expires_at = session.expires_at, "Session saved");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to save session");
                false
            }
        }
    }

    /// The persisted session, refreshed first if it has already expired.
    pub async fn get_session(&self) -> Option<Session> {
        let session = self.load_session().await?;
        if session.is_expired() {
            debug!(expires_at = session.expires_at, "Stored session expired, refreshing");
            return self.refresh_session(session).await;
        }
        Some(session)
    }

    /// Exchange the session's refresh token for a new session.
    ///
    /// On success the new session is persisted and returned. On any failure
    /// all local state is erased and `None` is returned; the caller should
    /// treat that as signed out rather than retry. Concurrent calls for the
    /// same refresh token share one request.
    pub async fn refresh_session(&self, session: Session) -> Option<Session> {
        if !session.can_refresh() {
            warn!("Session has no refresh token, erasing");
            self.remove_session().await;
            return None;
        }
        self.refresh_flight(session).await
    }

    /// Join the in-flight refresh for this token, or start one.
    fn refresh_flight(&self, session: Session) -> RefreshFuture {
        let mut slot = lock(&self.inner.in_flight);
        if let Some(flight) = slot.as_ref() {
            if flight.refresh_token == session.refresh_token {
                debug!("Joining in-flight session refresh");
                return flight.future.clone();
            }
        }

        let refresh_token = session.refresh_token.clone();
        let manager = self.clone();
        let future = async move {
            let result = manager.perform_refresh(&session).await;
            manager.finish_flight(&session.refresh_token);
            result
        }
        .boxed()
        .shared();

        *slot = Some(InFlightRefresh {
            refresh_token,
            future: future.clone(),
        });
        future
    }

    fn finish_flight(&self, refresh_token: &str) {
        let mut slot = lock(&self.inner.in_flight);
        if slot
            .as_ref()
            .is_some_and(|flight| flight.refresh_token == refresh_token)
        {
            *slot = None;
        }
    }

    async fn perform_refresh(&self, session: &Session) -> Option<Session> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        // A caller holding a stale copy may arrive after the rotation landed.
        // Its token is spent; only the stored session can be renewed.
        if let Some(current) = self.load_session().await {
            if current.refresh_token != session.refresh_token {
                if !current.needs_refresh(self.refresh_margin) {
                    debug!("Session already rotated, using stored session");
                    return Some(current);
                }
                debug!("Session already rotated, refreshing stored session");
                return self.refresh_session(current).await;
            }
        }

        match self.inner.backend.refresh(&session.refresh_token).await {
            Ok(mut fresh) => {
                if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                    info!("Local session erased during refresh, discarding result");
                    return None;
                }
                if fresh.user.is_none() {
                    fresh.user = session.user.clone();
                }
                if !self.save_session(&fresh).await {
                    warn!("Refreshed session could not be persisted");
                }
                info!(expires_at = fresh.expires_at, "Session refreshed");
                Some(fresh)
            }
            Err(e) => {
                if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                    debug!(error = %e, "Refresh failed after local session was erased");
                    return None;
                }
                warn!(
                    error = %e,
                    transient = e.is_transient(),
                    "Session refresh failed, erasing local session"
                );
                self.remove_session().await;
                None
            }
        }
    }

    /// The current session, refreshed first if it expires within the
    /// refresh margin. Entry point for every protected operation.
    pub async fn ensure_valid_session(&self) -> Option<Session> {
        let session = self.get_session().await?;
        if !session.needs_refresh(self.refresh_margin) {
            return Some(session);
        }
        debug!(
            minutes_left = session.minutes_until_expiry(),
            "Session close to expiry, refreshing"
        );
        self.refresh_session(session).await
    }

    /// Erase the session, cached user info and cached credentials.
    ///
    /// Returns `false` if any entry could not be removed.
    pub async fn remove_session(&self) -> bool {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.in_flight).take();

        let mut ok = true;
        for (store, key) in [
            (&self.inner.store, SESSION_KEY),
            (&self.inner.store, USER_INFO_KEY),
            (&self.inner.secrets, CREDENTIALS_KEY),
        ] {
            if let Err(e) = store.remove(key).await {
                error!(error = %e, key, "Failed to remove session state");
                ok = false;
            }
        }
        if ok {
            info!("Local session erased");
        }
        ok
    }

    // ===== User info =====

    pub async fn user_info(&self) -> Option<User> {
        match Self::read_json(&*self.inner.store, USER_INFO_KEY).await {
            Ok(user) => user,
            Err(e) => {
                error!(error = %e, "Failed to get user info");
                None
            }
        }
    }

    pub async fn save_user_info(&self, user: &User) -> bool {
        match Self::write_json(&*self.inner.store, USER_INFO_KEY, user).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to save user info");
                false
            }
        }
    }

    // ===== Cached credentials =====

    pub(crate) async fn cached_credentials(&self) -> Option<Credentials> {
        match Self::read_json(&*self.inner.secrets, CREDENTIALS_KEY).await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!(error = %e, "Failed to get cached credentials");
                None
            }
        }
    }

    pub(crate) async fn cache_credentials(&self, credentials: &Credentials) -> bool {
        match Self::write_json(&*self.inner.secrets, CREDENTIALS_KEY, credentials).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to cache credentials");
                false
            }
        }
    }

    pub(crate) async fn clear_credentials(&self) -> bool {
        match self.inner.secrets.remove(CREDENTIALS_KEY).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to clear cached credentials");
                false
            }
        }
    }

    // ===== Account operations =====

    /// Persist a freshly issued session along with its user.
    async fn adopt_session(&self, session: &Session) {
        self.save_session(session).await;
        if let Some(ref user) = session.user {
            self.save_user_info(user).await;
        }
    }

    /// Sign in with email and password and persist the resulting session.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let session = self.inner.backend.sign_in(email, password).await?;
        self.adopt_session(&session).await;
        Ok(session)
    }

    /// Create an account.
    ///
    /// When the backend requires email verification the credentials are
    /// cached so `wait_for_email_verification` can sign in once the address
    /// is confirmed.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, ApiError> {
        match self.inner.backend.sign_up(email, password).await? {
            SignUpResponse::Session(session) => {
                self.adopt_session(&session).await;
                self.clear_credentials().await;
                Ok(SignUpOutcome::SignedIn(session))
            }
            SignUpResponse::Unconfirmed(user) => {
                self.save_user_info(&user).await;
                let credentials = Credentials {
                    email: email.to_string(),
                    password: password.to_string(),
                };
                if !self.cache_credentials(&credentials).await {
                    warn!("Verification will need a manual sign-in");
                }
                Ok(SignUpOutcome::VerificationPending(user))
            }
        }
    }

    /// Sign out remotely (best effort) and erase all local state.
    pub async fn sign_out(&self) -> bool {
        if let Some(session) = self.load_session().await {
            if let Err(e) = self.inner.backend.sign_out(&session.access_token).await {
                warn!(error = %e, "Remote sign-out failed, erasing local session anyway");
            }
        }
        self.remove_session().await
    }

    /// Reconcile local storage with a session change pushed by the auth service.
    pub async fn apply_auth_event(&self, event: AuthEvent) {
        debug!(event = event.kind(), "Applying auth event");
        match event {
            AuthEvent::SignedIn(session) => {
                self.adopt_session(&session).await;
            }
            AuthEvent::TokenRefreshed(session) => {
                // A rotation can land after a local sign-out.
                if self.load_session().await.is_none() {
                    debug!("Ignoring token refresh for a session no longer held");
                    return;
                }
                self.adopt_session(&session).await;
            }
            AuthEvent::SignedOut => {
                self.remove_session().await;
            }
            AuthEvent::UserUpdated(user) => {
                self.save_user_info(&user).await;
            }
        }
    }
}
