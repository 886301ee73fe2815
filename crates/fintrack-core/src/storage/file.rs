use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{validate_key, KeyValueStore, StorageError};

/// Stores each key as `<dir>/<key>.json`.
///
/// Writes go to a temporary sibling file that is renamed into place, so a
/// crash mid-write never leaves a truncated session behind. On unix the files
/// are created with mode 0600.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run a filesystem operation for `key` on the blocking pool.
    async fn blocking<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &str) -> std::io::Result<T> + Send + 'static,
    {
        validate_key(key)?;
        let dir = self.dir.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            op(&dir, &key).map_err(|source| StorageError::Io { key, source })
        })
        .await?
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.json", key))
}

fn write_atomic(dir: &Path, key: &str, value: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(".{}.json.tmp", key));
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(value.as_bytes())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, entry_path(dir, key))
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.blocking(key, |dir, key| match std::fs::read_to_string(entry_path(dir, key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let value = value.to_string();
        let bytes = value.len();
        self.blocking(key, move |dir, key| write_atomic(dir, key, &value))
            .await?;
        debug!(key, bytes, "Stored entry");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = self
            .blocking(key, |dir, key| match std::fs::remove_file(entry_path(dir, key)) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            })
            .await?;
        if removed {
            debug!(key, "Removed entry");
        }
        Ok(())
    }
}
