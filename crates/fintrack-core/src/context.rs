//! Application context: the session manager, its listener and the clients,
//! built once at startup and passed to whatever needs them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tracing::info;

use crate::api::{AuthClient, DataClient};
use crate::auth::{SessionListener, SessionManager};
use crate::config::BackendConfig;
use crate::storage::{FileStore, KeyValueStore, KeyringStore};
use crate::subscription::{check_premium_access, PremiumAccess, SubscriptionClient};

pub struct AppContext {
    pub auth: AuthClient,
    pub sessions: SessionManager,
    pub data: DataClient,
    pub subscriptions: Option<SubscriptionClient>,
    listener: Option<SessionListener>,
}

impl AppContext {
    /// Wire up the clients with file-backed session storage in `cache_dir`
    /// and keychain-backed credential storage.
    pub fn new(backend: &BackendConfig, cache_dir: &Path) -> Result<Self> {
        Self::with_stores(
            backend,
            Arc::new(FileStore::new(cache_dir)),
            Arc::new(KeyringStore::default()),
        )
    }

    pub fn with_stores(
        backend: &BackendConfig,
        store: Arc<dyn KeyValueStore>,
        secrets: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let auth = AuthClient::new(&backend.supabase_url, &backend.supabase_anon_key)
            .context("Failed to create auth client")?;
        let data = DataClient::new(&backend.supabase_url, &backend.supabase_anon_key)
            .context("Failed to create data client")?;
        let subscriptions = backend
            .revenuecat_api_key
            .as_deref()
            .map(|key| SubscriptionClient::new(&backend.revenuecat_base_url, key))
            .transpose()
            .context("Failed to create subscription client")?;

        let sessions = SessionManager::new(Arc::new(auth.clone()), store, secrets)
            .with_refresh_margin(Duration::seconds(backend.refresh_margin_secs));

        Ok(Self {
            auth,
            sessions,
            data,
            subscriptions,
            listener: None,
        })
    }

    /// Start syncing local storage with auth events. Must run inside a
    /// tokio runtime; calling it again is a no-op.
    pub fn start_listener(&mut self) -> &SessionListener {
        let sessions = &self.sessions;
        self.listener
            .get_or_insert_with(|| sessions.initialize_session_listener())
    }

    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(SessionListener::is_running)
    }

    /// Data client acting as the current user (anonymous without a session).
    pub async fn authenticated_data(&self) -> DataClient {
        let session = self.sessions.ensure_valid_session().await;
        self.data.for_session(session.as_ref())
    }

    pub async fn premium_access(&self) -> PremiumAccess {
        check_premium_access(&self.sessions, &self.data, self.subscriptions.as_ref()).await
    }

    /// Stop the listener. Pairs with `start_listener`.
    pub fn shutdown(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
            info!("Application context shut down");
        }
    }
}
