//! Keeps local session storage in sync with the auth service.
//!
//! The auth service can rotate tokens or end the session without the app
//! asking (another device revoking it, for instance). The listener applies
//! every pushed `AuthEvent` to the `SessionManager` so the cached session
//! never drifts from the authoritative one.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::SessionManager;

pub(crate) struct ListenerTask {
    handle: JoinHandle<()>,
}

impl Drop for ListenerTask {
    fn drop(&mut self) {
        self.handle.abort();
        debug!("Session listener stopped");
    }
}

/// Owned subscription to the auth event stream.
///
/// Clones share one subscription. The subscription ends when the last clone
/// is dropped or shut down.
#[derive(Clone)]
pub struct SessionListener {
    task: Arc<ListenerTask>,
}

impl SessionListener {
    pub fn is_running(&self) -> bool {
        !self.task.handle.is_finished()
    }

    /// Release this handle. The subscription stops once no handle remains.
    pub fn shutdown(self) {
        if Arc::strong_count(&self.task) > 1 {
            debug!("Session listener still held elsewhere");
        }
    }

    #[cfg(test)]
    pub(crate) fn same_subscription(&self, other: &SessionListener) -> bool {
        Arc::ptr_eq(&self.task, &other.task)
    }
}

impl SessionManager {
    /// Subscribe to auth events and apply them to local storage.
    ///
    /// Idempotent while a handle is alive: later calls return a handle to the
    /// existing subscription. Must be called from within a tokio runtime.
    pub fn initialize_session_listener(&self) -> SessionListener {
        let mut slot = self.listener_slot();
        if let Some(task) = slot.upgrade() {
            if !task.handle.is_finished() {
                debug!("Session listener already running");
                return SessionListener { task };
            }
        }

        let mut events = self.backend().subscribe();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => manager.apply_auth_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session listener fell behind auth events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Auth event stream closed");
                        break;
                    }
                }
            }
        });

        let task = Arc::new(ListenerTask { handle });
        *slot = Arc::downgrade(&task);
        info!("Session listener started");
        SessionListener { task }
    }
}
