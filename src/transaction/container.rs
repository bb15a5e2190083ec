//! # File Container
//!
//! The container is the process-level registry of locked files: it maps an
//! upper-cased absolute path to the handle holding that file's exclusive
//! lock. Locks are sidecar `.lock` files created atomically; acquisition
//! retries on a fixed delay until the configured wait timeout elapses.
//!
//! A path is registered here exactly once. Close releases the lock and
//! drops the registration; `close_with_errors` force-releases everything
//! and aggregates the failures instead of stopping at the first.

use crate::error::{QueryError, QueryResult};
use hashbrown::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// An acquired exclusive lock on one file. The lock is the existence of
/// the sidecar file; dropping the handle releases it as a fallback for
/// error paths that skip explicit close.
#[derive(Debug)]
pub struct FileHandle {
    path: String,
    lock_path: PathBuf,
    released: parking_lot::Mutex<bool>,
}

impl FileHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn release(&self) -> QueryResult<()> {
        let mut released = self.released.lock();
        if *released {
            return Ok(());
        }
        fs::remove_file(&self.lock_path).map_err(|e| QueryError::Io {
            message: format!("failed to unlock {}: {}", self.path, e),
        })?;
        *released = true;
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let released = *self.released.lock();
        if !released {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.lock", file_name))
}

#[derive(Debug, Default)]
pub struct Container {
    handles: HashMap<String, Arc<FileHandle>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.handles.contains_key(&path.to_uppercase())
    }

    pub fn handle(&self, path: &str) -> Option<Arc<FileHandle>> {
        self.handles.get(&path.to_uppercase()).cloned()
    }

    /// Acquires the exclusive lock for a path with bounded retry. A lock
    /// already held by this container is returned as-is; a lock held
    /// elsewhere is retried every `retry_delay` until `wait_timeout`
    /// seconds have passed, then surfaces LockTimeout.
    pub fn lock(
        &mut self,
        path: &str,
        wait_timeout: f64,
        retry_delay: Duration,
    ) -> QueryResult<Arc<FileHandle>> {
        let key = path.to_uppercase();
        if let Some(handle) = self.handles.get(&key) {
            return Ok(handle.clone());
        }

        let lock_path = lock_path_for(Path::new(path));
        let deadline = Instant::now() + Duration::from_secs_f64(wait_timeout.max(0.0));
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    debug!(path, "file lock acquired");
                    let handle = Arc::new(FileHandle {
                        path: path.to_string(),
                        lock_path,
                        released: parking_lot::Mutex::new(false),
                    });
                    self.handles.insert(key, handle.clone());
                    return Ok(handle);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if deadline <= Instant::now() {
                        return Err(QueryError::LockTimeout {
                            path: path.to_string(),
                        });
                    }
                    std::thread::sleep(retry_delay);
                }
                Err(e) => {
                    return Err(QueryError::Io {
                        message: format!("failed to lock {}: {}", path, e),
                    })
                }
            }
        }
    }

    /// Releases one path's lock and forgets the handle.
    pub fn close(&mut self, path: &str) -> QueryResult<()> {
        if let Some(handle) = self.handles.remove(&path.to_uppercase()) {
            handle.release()?;
            debug!(path, "file lock released");
        }
        Ok(())
    }

    pub fn close_all(&mut self) -> QueryResult<()> {
        let keys: Vec<String> = self.handles.keys().cloned().collect();
        for key in keys {
            if let Some(handle) = self.handles.remove(&key) {
                handle.release()?;
            }
        }
        Ok(())
    }

    /// Force-release every lock, collecting errors instead of aborting on
    /// the first. Used on session teardown after a failure.
    pub fn close_all_with_errors(&mut self) -> QueryResult<()> {
        let mut messages = Vec::new();
        let keys: Vec<String> = self.handles.keys().cloned().collect();
        for key in keys {
            if let Some(handle) = self.handles.remove(&key) {
                if let Err(e) = handle.release() {
                    messages.push(e.to_string());
                }
            }
        }
        if messages.is_empty() {
            Ok(())
        } else {
            Err(QueryError::ForcedUnlock { messages })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_creates_and_release_removes_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "c1\n1\n").unwrap();
        let path_str = path.to_string_lossy().to_string();

        let mut container = Container::new();
        container
            .lock(&path_str, 1.0, Duration::from_millis(1))
            .unwrap();
        assert!(dir.path().join(".data.csv.lock").exists());

        container.close(&path_str).unwrap();
        assert!(!dir.path().join(".data.csv.lock").exists());
    }

    #[test]
    fn relock_of_held_path_reuses_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv").to_string_lossy().to_string();

        let mut container = Container::new();
        let first = container.lock(&path, 1.0, Duration::from_millis(1)).unwrap();
        let second = container.lock(&path, 1.0, Duration::from_millis(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn foreign_lock_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let path_str = path.to_string_lossy().to_string();
        fs::write(dir.path().join(".data.csv.lock"), "").unwrap();

        let mut container = Container::new();
        let err = container
            .lock(&path_str, 0.05, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, QueryError::LockTimeout { .. }));
    }
}
