//! JSON snapshot files for scheduler and device state.
//!
//! Snapshots are encoded while the caller still holds its state lock
//! ([`SnapshotFile::stage`]) and written afterwards
//! ([`SnapshotFile::commit`]), so no lock is held across file I/O. Every
//! staged snapshot carries a sequence number; a commit that arrives after a
//! newer one has landed is dropped.

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How a snapshot was obtained on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// No file yet, fresh state.
    Missing,
    Restored,
    /// File could not be read or decoded. A copy was moved aside and the
    /// state starts fresh.
    Corrupt,
}

/// Encoded state waiting to be written.
#[derive(Debug)]
pub struct StagedSnapshot {
    sequence: u64,
    json: String,
}

#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    staged: AtomicU64,
    /// Sequence number of the snapshot on disk. Held for the whole write.
    written: Mutex<u64>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            staged: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot, falling back to `T::default()`.
    pub fn load<T: DeserializeOwned + Default>(&self) -> (T, SnapshotStatus) {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no snapshot found, starting with empty state");
                return (T::default(), SnapshotStatus::Missing);
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "snapshot unreadable, starting with empty state");
                return (T::default(), SnapshotStatus::Corrupt);
            }
        };

        match serde_json::from_str(&contents) {
            Ok(value) => {
                info!(path = %self.path.display(), "snapshot restored");
                (value, SnapshotStatus::Restored)
            }
            Err(e) => {
                let aside = self.corrupt_path();
                error!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "snapshot corrupt, scheduled state lost"
                );
                if let Err(e) = fs::rename(&self.path, &aside) {
                    error!(error = %e, "could not move corrupt snapshot aside");
                }
                (T::default(), SnapshotStatus::Corrupt)
            }
        }
    }

    /// Encodes `value` and numbers it after every snapshot staged before.
    pub fn stage<T: Serialize>(&self, value: &T) -> Result<StagedSnapshot, PersistenceError> {
        let json = serde_json::to_string_pretty(value)?;
        let sequence = self.staged.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StagedSnapshot { sequence, json })
    }

    /// Atomic write through a temp file and rename. Returns `false` when a
    /// newer snapshot is already on disk and nothing was written.
    pub async fn commit(&self, staged: StagedSnapshot) -> Result<bool, PersistenceError> {
        let mut written = self.written.lock().await;
        if staged.sequence <= *written {
            debug!(path = %self.path.display(), sequence = staged.sequence, "snapshot superseded");
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| PersistenceError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, staged.json)
            .await
            .map_err(|source| PersistenceError::Io {
                path: temp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| PersistenceError::Io {
                path: self.path.clone(),
                source,
            })?;
        *written = staged.sequence;
        Ok(true)
    }

    /// Blocks writers until the guard is dropped.
    #[cfg(test)]
    pub(crate) async fn hold_writes(&self) -> tokio::sync::MutexGuard<'_, u64> {
        self.written.lock().await
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }
}
