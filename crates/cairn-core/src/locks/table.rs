//! Shared lock tables

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

use super::LockEntries;
use crate::error::{Error, Result};

// The mutex is taken on the caller's thread, so a busy sidecar blocks the
// event loop for at most MUTEX_RETRY_DELAY * MUTEX_MAX_ATTEMPTS (200ms).
const MUTEX_RETRY_DELAY: Duration = Duration::from_millis(2);
const MUTEX_MAX_ATTEMPTS: usize = 100;
const STALE_MUTEX_AGE: Duration = Duration::from_secs(10);

/// Durable lock table shared by cooperating participants.
///
/// `transact` is the only mutation path: it runs `apply` against the latest
/// entries with exclusive access and persists them if `apply` returns `true`.
pub trait LockTable: Send + Sync {
    fn transact(&self, apply: &mut dyn FnMut(&mut LockEntries) -> bool) -> Result<LockEntries>;

    /// Ticks whenever the table may have changed
    fn subscribe(&self) -> watch::Receiver<u64>;

    fn load(&self) -> Result<LockEntries> {
        self.transact(&mut |_| false)
    }
}

/// Table shared by participants inside one process
pub struct MemoryLockTable {
    entries: Mutex<LockEntries>,
    changes: watch::Sender<u64>,
}

impl MemoryLockTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LockEntries::new()),
            changes: watch::Sender::new(0),
        }
    }
}

impl Default for MemoryLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable for MemoryLockTable {
    fn transact(&self, apply: &mut dyn FnMut(&mut LockEntries) -> bool) -> Result<LockEntries> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        if apply(&mut next) && next != *entries {
            *entries = next.clone();
            self.changes.send_modify(|version| *version += 1);
        }
        Ok(next)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

/// Table stored as a JSON file, shared by separate processes.
///
/// Writers serialize through an exclusive `<file>.lock` sidecar and replace
/// the table atomically by renaming a temporary file over it. Changes made by
/// other processes are picked up by watching the parent directory.
pub struct FileLockTable {
    path: PathBuf,
    changes: Arc<watch::Sender<u64>>,
    _watcher: RecommendedWatcher,
}

impl FileLockTable {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&parent)?;

        let file_name = path
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("Invalid lock file {}", path.display())))?
            .to_os_string();
        let changes = Arc::new(watch::Sender::new(0u64));
        let notifier = changes.clone();
        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| match event {
                Ok(event) => {
                    if event
                        .paths
                        .iter()
                        .any(|changed| changed.file_name() == Some(file_name.as_os_str()))
                    {
                        notifier.send_modify(|version| *version += 1);
                    }
                }
                Err(error) => tracing::warn!(%error, "Lock table watch error"),
            })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        tracing::debug!(path = %path.display(), "Opened lock table");
        Ok(Self {
            path,
            changes,
            _watcher: watcher,
        })
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn read(&self) -> Result<LockEntries> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(LockEntries::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(LockEntries::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn write(&self, entries: &LockEntries) -> Result<()> {
        let temp = self.sidecar(".tmp");
        fs::write(&temp, serde_json::to_vec(entries)?)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn acquire_mutex(&self) -> Result<MutexFile> {
        let path = self.sidecar(".lock");
        for _ in 0..MUTEX_MAX_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(MutexFile(path)),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        tracing::warn!(path = %path.display(), "Removing stale lock table mutex");
                        fs::remove_file(&path).ok();
                        continue;
                    }
                    std::thread::sleep(MUTEX_RETRY_DELAY);
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(Error::Database(format!(
            "Timed out waiting for lock table mutex {}",
            path.display()
        )))
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_MUTEX_AGE)
}

/// Removes the mutex sidecar on drop
struct MutexFile(PathBuf);

impl Drop for MutexFile {
    fn drop(&mut self) {
        fs::remove_file(&self.0).ok();
    }
}

impl LockTable for FileLockTable {
    fn transact(&self, apply: &mut dyn FnMut(&mut LockEntries) -> bool) -> Result<LockEntries> {
        let _mutex = self.acquire_mutex()?;
        let current = self.read()?;
        let mut next = current.clone();
        if apply(&mut next) && next != current {
            self.write(&next)?;
            self.changes.send_modify(|version| *version += 1);
        }
        Ok(next)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
