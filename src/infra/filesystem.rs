//! Filesystem operations
//!
//! Directory helpers plus locked read-modify-write of shared JSON state
//! files. Every process that touches a state file takes the same sibling
//! `.lock` file first, so updates from several workers serialize.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FilesystemError;

/// Create a directory and all parent directories
pub fn create_dir_all(path: &Path) -> Result<(), FilesystemError> {
    std::fs::create_dir_all(path).map_err(|e| FilesystemError::CreateDir {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Write content to a file
pub fn write_file(path: &Path, content: &str) -> Result<(), FilesystemError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    std::fs::write(path, content).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Read content from a file
pub fn read_file(path: &Path) -> Result<String, FilesystemError> {
    std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Path of the lock file guarding `path`
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Held lock on a state file; released on drop
struct StateLock {
    lock: fslock::LockFile,
    path: PathBuf,
}

impl StateLock {
    fn acquire(path: &Path) -> Result<Self, FilesystemError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let lock_path = lock_path(path);
        let map_err = |e: std::io::Error| FilesystemError::Lock {
            path: lock_path.clone(),
            error: e.to_string(),
        };

        let mut lock = fslock::LockFile::open(&lock_path).map_err(map_err)?;
        lock.lock().map_err(map_err)?;
        Ok(Self {
            lock,
            path: lock_path,
        })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}

fn load_json<T>(path: &Path) -> Result<T, FilesystemError>
where
    T: Default + DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = read_file(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).map_err(|e| FilesystemError::Decode {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Write `value` as JSON through a temp file and rename
fn store_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FilesystemError> {
    let content = serde_json::to_string_pretty(value).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    write_file(&tmp, &content)?;
    std::fs::rename(&tmp, path).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Read a JSON state file under its lock. A missing file reads as `T::default()`.
pub fn read_json_locked<T>(path: &Path) -> Result<T, FilesystemError>
where
    T: Default + DeserializeOwned,
{
    let _lock = StateLock::acquire(path)?;
    load_json(path)
}

/// Load, mutate and write back a JSON state file as one locked step.
///
/// The closure's return value is passed through. The file is written even
/// when the closure leaves the state unchanged.
pub fn update_json_locked<T, R, F>(path: &Path, update: F) -> Result<R, FilesystemError>
where
    T: Default + Serialize + DeserializeOwned,
    F: FnOnce(&mut T) -> R,
{
    let _lock = StateLock::acquire(path)?;
    let mut state: T = load_json(path)?;
    let result = update(&mut state);
    store_json(path, &state)?;
    Ok(result)
}

/// Run a blocking filesystem job on the blocking pool
pub async fn blocking<T, F>(job: F) -> Result<T, FilesystemError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FilesystemError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| FilesystemError::Task(e.to_string()))?
}
