//! Durable session snapshots.
//!
//! One JSON file maps session tokens to a [`PersistedSession`]: the
//! principal snapshot and the expiry descriptor live in the same record, so
//! they are always written and removed together. Every change rewrites the
//! file through a temp file and `rename`. A file that no longer parses is
//! moved aside to `<file>.corrupt` on the next read-modify-write.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kernel::impersonation::ImpersonationContext;
use crate::types::Principal;

/// Errors from the snapshot file.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Reading or writing the file failed.
    #[error("session snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The file content is not a valid snapshot map.
    #[error("session snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Session descriptor: only the absolute expiry instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Instant after which the session must not be restored.
    pub expires_at: DateTime<Utc>,
}

/// One persisted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    /// Acting principal snapshot.
    pub principal: Principal,
    /// Expiry descriptor.
    pub session: SessionDescriptor,
    /// Active impersonation, so a restart keeps the way back.
    #[serde(default)]
    pub impersonation: Option<ImpersonationContext>,
}

/// File-backed map of token -> [`PersistedSession`].
#[derive(Debug)]
pub struct SessionSnapshotStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionSnapshotStore {
    /// Store backed by `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every persisted session. A missing file is an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<BTreeMap<String, PersistedSession>, PersistenceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`load`](Self::load), but a corrupt file is moved aside to
    /// [`quarantine_path`](Self::quarantine_path) and read as an empty map,
    /// so later writes start a fresh file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or moved aside.
    pub fn load_or_quarantine(
        &self,
    ) -> Result<BTreeMap<String, PersistedSession>, PersistenceError> {
        let _guard = self.lock_writes();
        self.load_recovering()
    }

    /// Where a corrupt snapshot file is moved: `<file>.corrupt`.
    pub fn quarantine_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }

    /// Insert or replace the record for `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or rewritten.
    pub fn put(&self, token: &str, record: PersistedSession) -> Result<(), PersistenceError> {
        self.update(|map| {
            map.insert(token.to_owned(), record);
        })
    }

    /// Remove the record for `token`. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or rewritten.
    pub fn remove(&self, token: &str) -> Result<bool, PersistenceError> {
        let mut removed = false;
        self.update(|map| {
            removed = map.remove(token).is_some();
        })?;
        Ok(removed)
    }

    /// Keep only records for which `keep` returns true.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or rewritten.
    pub fn retain(
        &self,
        mut keep: impl FnMut(&str, &PersistedSession) -> bool,
    ) -> Result<usize, PersistenceError> {
        let mut dropped = 0usize;
        self.update(|map| {
            let before = map.len();
            map.retain(|token, record| keep(token.as_str(), record));
            dropped = before.saturating_sub(map.len());
        })?;
        Ok(dropped)
    }

    /// Read-modify-write under the store's lock.
    fn update(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, PersistedSession>),
    ) -> Result<(), PersistenceError> {
        let _guard = self.lock_writes();
        let mut map = self.load_recovering()?;
        f(&mut map);
        self.write_atomic(&map)
    }

    /// Load, quarantining a corrupt file. Caller holds the write lock.
    fn load_recovering(&self) -> Result<BTreeMap<String, PersistedSession>, PersistenceError> {
        match self.load() {
            Err(PersistenceError::Corrupt(e)) => {
                let aside = self.quarantine_path();
                std::fs::rename(&self.path, &aside)?;
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    "corrupt session snapshot moved aside, starting empty"
                );
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_atomic(&self, map: &BTreeMap<String, PersistedSession>) -> Result<(), PersistenceError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(map)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), sessions = map.len(), "session snapshot written");
        Ok(())
    }
}
