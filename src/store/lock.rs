//! The exclusive state lock, as a type-level witness.
//!
//! Any read-modify-write on the persistent state must happen under an
//! exclusive advisory lock held for the whole cycle. Instead of a runtime
//! flag, holding the lock is represented by owning a [`StateLock`] value:
//! state-mutating functions take `&StateLock`, so a write outside the lock
//! does not compile. Dropping the value releases the lock.

use crate::errors::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Proof that the exclusive advisory lock on the state lock-file is held.
///
/// Not `Clone`: exactly one witness exists per acquisition. The lock is
/// released when the value is dropped.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl StateLock {
    /// Acquire the exclusive lock, blocking until peer holders release it.
    /// The lock file is created if absent.
    pub fn acquire(lock_path: &Path) -> Result<StateLock, StoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::LockFailed {
                path: lock_path.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|source| StoreError::LockFailed {
                path: lock_path.to_path_buf(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| StoreError::LockFailed {
            path: lock_path.to_path_buf(),
            source,
        })?;
        Ok(StateLock { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.lock");
        let _lock = StateLock::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn test_acquire_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("nested/dir/state.lock");
        let _lock = StateLock::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn test_reacquire_after_drop() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.lock");
        {
            let _lock = StateLock::acquire(&lock_path).unwrap();
        }
        // Dropped; a fresh acquisition must not block.
        let _lock = StateLock::acquire(&lock_path).unwrap();
    }
}
