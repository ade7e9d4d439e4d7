//! One mutual-exclusion lock per loom file.
//!
//! A [`FileLease`] is handed out by [`LockTable::acquire`] and releases its
//! lock when dropped. Acquisition waits at most the configured timeout and
//! then fails with [`LoomError::LockTimeout`], holding nothing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use loom_core::{LoomError, Result};

/// A binary semaphore with a timed acquire.
#[derive(Debug, Default)]
pub struct FileLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl FileLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock is free or `timeout` has passed.
    fn acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while *held {
            if self.released.wait_until(&mut held, deadline).timed_out() && *held {
                return false;
            }
        }
        *held = true;
        true
    }

    fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_one();
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

/// Exclusive access to one file, released on drop.
#[derive(Debug)]
pub struct FileLease {
    lock: Arc<FileLock>,
    path: PathBuf,
}

impl FileLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "releasing file lock");
        self.lock.release();
    }
}

/// Locks keyed by absolute file path, created on first use.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<PathBuf, Arc<FileLock>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<FileLock> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Acquire the lock for `path`, waiting at most `timeout`.
    pub fn acquire(&self, path: &Path, timeout: Duration) -> Result<FileLease> {
        let lock = self.lock_for(path);
        if !lock.acquire_for(timeout) {
            warn!(path = %path.display(), ?timeout, "timed out waiting for file lock");
            return Err(LoomError::LockTimeout {
                path: path.to_path_buf(),
                timeout,
            });
        }
        debug!(path = %path.display(), "acquired file lock");
        Ok(FileLease {
            lock,
            path: path.to_path_buf(),
        })
    }

    /// Whether some lease on `path` is currently alive.
    pub fn is_locked(&self, path: &Path) -> bool {
        self.locks
            .lock()
            .get(path)
            .map(|l| l.is_held())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn lease_releases_on_drop() {
        let table = LockTable::new();
        let path = Path::new("/data/a.loom");
        let lease = table.acquire(path, Duration::from_millis(10)).unwrap();
        assert!(table.is_locked(path));
        assert_eq!(lease.path(), path);
        drop(lease);
        assert!(!table.is_locked(path));
        assert!(table.acquire(path, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn contention_times_out_without_leaking() {
        let table = LockTable::new();
        let path = Path::new("/data/a.loom");
        let _held = table.acquire(path, Duration::ZERO).unwrap();
        let err = table.acquire(path, Duration::from_millis(20)).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, LoomError::LockTimeout { .. }));
        assert!(table.acquire(Path::new("/data/b.loom"), Duration::ZERO).is_ok());
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let table = Arc::new(LockTable::new());
        let path = PathBuf::from("/data/a.loom");
        let lease = table.acquire(&path, Duration::ZERO).unwrap();
        let waiter = {
            let table = Arc::clone(&table);
            let path = path.clone();
            thread::spawn(move || table.acquire(&path, Duration::from_secs(5)).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        drop(lease);
        assert!(waiter.join().unwrap().is_ok());
        assert!(!table.is_locked(&path));
    }
}
