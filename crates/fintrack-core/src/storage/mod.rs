//! Local key-value persistence for session state.
//!
//! The session manager keeps three string-serialized JSON entries: the
//! session, a cached user-info object and (transiently) the sign-up
//! credentials. This module provides the `KeyValueStore` seam plus the
//! backends used by the application:
//! - `FileStore`: one JSON file per key in the cache directory
//! - `KeyringStore`: OS keychain entries, used for credentials
//! - `MemoryStore`: process-local map for tests and embedding

pub mod file;
pub mod keyring;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use self::file::FileStore;
pub use self::keyring::KeyringStore;
pub use self::memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Keychain error on {key}: {source}")]
    Keychain {
        key: String,
        #[source]
        source: ::keyring::Error,
    },

    #[error("Malformed value under {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Async string key-value store.
///
/// Reads of a missing key return `Ok(None)`; removing a missing key is not an
/// error.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Keys end up as file names and keychain account names.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
