//! Per-path exclusive locks held across await points.
//!
//! A lock is identified by the filesystem path of its lock file.  Exclusion
//! has two layers: an in-process async mutex per path (so lock waits suspend
//! the task instead of the runtime) and an advisory `flock` on the lock file
//! (so workers sharing the cache directory -- even across machines on a
//! network mount -- exclude each other).
//!
//! The in-process registry is weakly held: the map entry for a path is
//! dropped as soon as the last holder or waiter releases it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lock acquisition exceeded its time budget.  Surfaces as 503.
#[derive(Debug, thiserror::Error)]
#[error("timed out acquiring lock on {} after {:?}", .path.display(), .waited)]
pub struct LockTimeout {
    pub path: PathBuf,
    pub waited: Duration,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
#[derive(Debug)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    refcount: usize,
}

/// Process-wide registry of per-path locks.
#[derive(Clone, Default)]
pub struct PathLocks {
    slots: Arc<Mutex<HashMap<PathBuf, Slot>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `path`, waiting at most `timeout`.
    ///
    /// The returned guard releases both layers on drop.  Cancelling the
    /// future mid-wait leaves the lock untouched.  Re-entrant acquisition
    /// from the same task deadlocks; callers must not hold a guard for a
    /// path while acquiring it again.
    pub async fn acquire(&self, path: &Path, timeout: Duration) -> Result<PathLockGuard> {
        let started = Instant::now();
        let slot = self.checkout(path);

        let task_guard = match tokio::time::timeout(timeout, slot.mutex.clone().lock_owned()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                return Err(LockTimeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                }
                .into());
            }
        };

        let file = self
            .flock_with_deadline(path, started, timeout)
            .await
            .map_err(|e| {
                debug!(path = %path.display(), error = %e, "flock acquisition failed");
                e
            })?;

        debug!(path = %path.display(), waited = ?started.elapsed(), "lock acquired");
        Ok(PathLockGuard {
            _task_guard: task_guard,
            file,
            slot,
        })
    }

    /// Register interest in `path` and hand out its shared slot handle.
    fn checkout(&self, path: &Path) -> SlotHandle {
        let mut slots = self.slots.lock().expect("lock registry poisoned");
        let slot = slots.entry(path.to_path_buf()).or_default();
        slot.refcount += 1;
        SlotHandle {
            path: path.to_path_buf(),
            mutex: Arc::clone(&slot.mutex),
            registry: Arc::clone(&self.slots),
        }
    }

    /// Take the file lock, polling non-blocking attempts with backoff so the
    /// wait stays cooperative.
    async fn flock_with_deadline(
        &self,
        path: &Path,
        started: Instant,
        timeout: Duration,
    ) -> Result<File> {
        let file = open_lock_file(path)?;
        let mut backoff = Duration::from_millis(10);
        loop {
            match try_flock(&file) {
                Ok(true) => return Ok(file),
                Ok(false) => {}
                Err(e) => return Err(e).context("flock failed"),
            }
            if started.elapsed() >= timeout {
                return Err(LockTimeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                }
                .into());
            }
            tokio::time::sleep(backoff.min(timeout.saturating_sub(started.elapsed()))).await;
            backoff = (backoff * 2).min(Duration::from_millis(500));
        }
    }

    /// Number of live holders/waiters, for tests.
    #[cfg(test)]
    fn registered_paths(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SlotHandle {
    path: PathBuf,
    mutex: Arc<AsyncMutex<()>>,
    registry: Arc<Mutex<HashMap<PathBuf, Slot>>>,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let mut slots = self.registry.lock().expect("lock registry poisoned");
        if let Some(slot) = slots.get_mut(&self.path) {
            slot.refcount -= 1;
            if slot.refcount == 0 {
                slots.remove(&self.path);
            }
        }
    }
}

/// Exclusive hold on one lock path.  Releasing is dropping.
#[derive(Debug)]
pub struct PathLockGuard {
    // Field order is drop order: the task mutex and flock go first, the
    // slot handle deregisters last.
    _task_guard: OwnedMutexGuard<()>,
    file: File,
    slot: SlotHandle,
}

impl PathLockGuard {
    pub fn path(&self) -> &Path {
        &self.slot.path
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        // Closing the fd would release the flock too; unlock explicitly so
        // the release is ordered before the registry entry goes away.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(path = %self.slot.path.display(), "flock unlock failed");
        }
    }
}

// ---------------------------------------------------------------------------
// flock helpers
// ---------------------------------------------------------------------------

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock dir: {}", parent.display()))?;
    }
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))
}

fn try_flock(file: &File) -> std::io::Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Non-blocking exclusive flock on `path`, used by the eviction sweep to
/// skip entries whose producer is still alive.  Returns `None` when the
/// lock is held elsewhere; the file lock is released when the returned
/// handle drops.
pub fn try_lock_exclusive(path: &Path) -> Result<Option<File>> {
    let file = open_lock_file(path)?;
    match try_flock(&file)? {
        true => Ok(Some(file)),
        false => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
