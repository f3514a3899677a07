//! Store directory layout and single-writer locking.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK            # Advisory lock for single-writer
//! └─ sync.journal    # Journal of the four sync tables
//! ```

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "sync.journal";

/// Returns the journal path inside a store directory.
pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join(JOURNAL_FILE)
}

/// An exclusively locked store directory.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the directory is missing and
    ///   `create_if_missing` is false
    /// - [`StoreError::Locked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::NotFound(path.to_path_buf()));
            }
        }
        if !path.is_dir() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal path.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        journal_path(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store_dir = StoreDir::open(&path, true).unwrap();
        assert!(path.join("LOCK").exists());
        assert_eq!(store_dir.journal_path(), path.join("sync.journal"));
    }

    #[test]
    fn missing_directory_without_create() {
        let dir = tempdir().unwrap();
        let result = StoreDir::open(&dir.path().join("absent"), false);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let _held = StoreDir::open(dir.path(), true).unwrap();
        assert!(matches!(
            StoreDir::open(dir.path(), true),
            Err(StoreError::Locked(_))
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        drop(StoreDir::open(dir.path(), true).unwrap());
        assert!(StoreDir::open(dir.path(), true).is_ok());
    }
}
