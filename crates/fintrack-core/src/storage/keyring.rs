use async_trait::async_trait;
use keyring::Entry;

use super::{validate_key, KeyValueStore, StorageError};

/// Default keychain service name.
pub const SERVICE_NAME: &str = "fintrack";

/// Stores values in the OS keychain, one entry per key.
///
/// Used for the cached sign-up credentials so the plaintext password never
/// lands in the cache directory.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Run `op` against the entry for `key` on the blocking pool. Platform
    /// keychains (secret-service over D-Bus in particular) may block.
    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Entry) -> keyring::Result<T> + Send + 'static,
    {
        validate_key(key)?;
        let service = self.service.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            Entry::new(&service, &key)
                .and_then(|entry| op(&entry))
                .map_err(|source| StorageError::Keychain { key, source })
        })
        .await?
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

#[async_trait]
impl KeyValueStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let value = value.to_string();
        self.with_entry(key, move |entry| entry.set_password(&value))
            .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }
}
