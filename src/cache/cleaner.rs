//! Size- and age-bounded LRU eviction over one cache tree.
//!
//! A sweep walks the two-level fan-out (`<root>/<2-hex>/<entry>`), deletes
//! entries past the age bound, then deletes oldest-mtime-first until the
//! tree fits its size bound.  mtime is refreshed on every cache hit, so
//! this is access order, not creation order.
//!
//! An entry is skipped when its `.lock` cannot be taken non-blocking (a
//! producer owns it) or when in-process readers are attached; the next
//! sweep gets another chance.  Unlinking is safe for concurrent readers:
//! an open descriptor keeps the unlinked inode readable.
//!
//! Sweeps are serialized across worker processes by `clean.lock` at the
//! tree root, and at most one runs per [`CLEAN_INTERVAL`] even when every
//! worker schedules one.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::lock::try_lock_exclusive;

use super::store::ReaderRegistry;

/// Minimum spacing between sweeps of one tree, across all workers.
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Stale tempfiles older than this are removed by the startup sweep.
pub const TMP_GRACE: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// CacheCleaner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CacheCleaner {
    root: PathBuf,
    max_bytes: u64,
    max_age: Option<Duration>,
    readers: ReaderRegistry,
}

struct EntryStat {
    path: PathBuf,
    name: String,
    size: u64,
    mtime: SystemTime,
}

impl CacheCleaner {
    pub fn new(
        root: PathBuf,
        max_bytes: u64,
        max_age: Option<Duration>,
        readers: ReaderRegistry,
    ) -> Self {
        Self {
            root,
            max_bytes,
            max_age,
            readers,
        }
    }

    /// Run one sweep on a blocking thread.  Returns the number of entries
    /// evicted (0 when another worker swept recently).
    pub async fn sweep(&self) -> Result<usize> {
        let cleaner = self.clone();
        tokio::task::spawn_blocking(move || cleaner.sweep_sync())
            .await
            .context("eviction sweep panicked")?
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn sweep_sync(&self) -> Result<usize> {
        if !self.root.is_dir() {
            return Ok(0);
        }

        let clean_lock = self.root.join("clean.lock");
        if recently_touched(&clean_lock, CLEAN_INTERVAL) {
            debug!("tree swept recently, skipping");
            return Ok(0);
        }
        let Some(_held) = try_lock_exclusive(&clean_lock)? else {
            debug!("another worker is sweeping");
            return Ok(0);
        };
        super::store::touch(&clean_lock).ok();

        let mut entries = self.scan()?;
        let total: u64 = entries.iter().map(|e| e.size).sum();
        debug!(
            entries = entries.len(),
            total,
            max_bytes = self.max_bytes,
            "sweep scan complete"
        );

        let now = SystemTime::now();
        let mut evicted = 0usize;
        let mut freed = 0u64;

        // Age bound first.
        if let Some(max_age) = self.max_age {
            entries.retain(|entry| {
                let expired = now
                    .duration_since(entry.mtime)
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                if expired && self.evict(entry) {
                    evicted += 1;
                    freed += entry.size;
                    return false;
                }
                true
            });
        }

        // Then LRU until the size bound holds.  Newest first so popping
        // takes the oldest.
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.mtime));
        while total - freed > self.max_bytes {
            let Some(entry) = entries.pop() else {
                break;
            };
            if self.evict(&entry) {
                evicted += 1;
                freed += entry.size;
            }
        }

        if evicted > 0 {
            info!(evicted, freed, "eviction sweep finished");
        }
        Ok(evicted)
    }

    /// Collect every ready entry in the tree (lock files, tempfiles and the
    /// clean lock are not entries).
    fn scan(&self) -> Result<Vec<EntryStat>> {
        let mut entries = Vec::new();
        for subdir in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to read cache tree: {}", self.root.display()))?
        {
            let subdir = match subdir {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !subdir.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let files = match std::fs::read_dir(subdir.path()) {
                Ok(files) => files,
                Err(_) => continue,
            };
            for file in files.flatten() {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.ends_with(".lock") || name.ends_with(".tmp") {
                    continue;
                }
                let Ok(meta) = file.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                entries.push(EntryStat {
                    path: file.path(),
                    name,
                    size: meta.len(),
                    mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        Ok(entries)
    }

    /// Unlink one entry unless it is busy.  Returns whether it was removed.
    fn evict(&self, entry: &EntryStat) -> bool {
        if self.readers.count(&entry.name) > 0 {
            debug!(entry = %entry.name, "skipping eviction: readers attached");
            return false;
        }
        let lock_path = entry.path.with_extension("lock");
        let held = match try_lock_exclusive(&lock_path) {
            Ok(Some(held)) => held,
            Ok(None) => {
                debug!(entry = %entry.name, "skipping eviction: producer holds lock");
                return false;
            }
            Err(e) => {
                warn!(entry = %entry.name, error = %e, "skipping eviction: lock probe failed");
                return false;
            }
        };
        let removed = match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!(entry = %entry.name, size = entry.size, "evicted");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(entry = %entry.name, error = %e, "eviction unlink failed");
                false
            }
        };
        drop(held);
        removed
    }

    /// Remove tempfiles older than `grace`.  Run once at startup, before
    /// any producer is live, to clear debris from crashed workers.
    pub fn sweep_stale_tmp(&self, grace: Duration) -> Result<usize> {
        if !self.root.is_dir() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let mut removed = 0usize;
        for subdir in std::fs::read_dir(&self.root)?.flatten() {
            if !subdir.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for file in std::fs::read_dir(subdir.path())?.flatten() {
                let name = file.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".tmp") {
                    continue;
                }
                let Ok(meta) = file.metadata() else {
                    continue;
                };
                let stale = meta
                    .modified()
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .map(|age| age > grace)
                    .unwrap_or(true);
                if stale && std::fs::remove_file(file.path()).is_ok() {
                    warn!(tmp = %name, "removed stale tempfile");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn recently_touched(path: &Path, window: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|age| age < window)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::set_mtime;

    fn write_entry(root: &Path, name: &str, size: usize, age: Duration) -> PathBuf {
        let dir = root.join(&name[..2]);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, vec![b'x'; size]).unwrap();
        set_mtime(&path, SystemTime::now() - age);
        path
    }

    fn key(n: u8) -> String {
        format!("{:02x}{}", n, "ab".repeat(31))
    }

    fn cleaner(root: &Path, max_bytes: u64, max_age: Option<Duration>) -> CacheCleaner {
        CacheCleaner::new(
            root.to_path_buf(),
            max_bytes,
            max_age,
            ReaderRegistry::default(),
        )
    }

    #[tokio::test]
    async fn under_budget_evicts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), &key(1), 100, Duration::from_secs(10));
        let cleaner = cleaner(dir.path(), 10_000, None);
        assert_eq!(cleaner.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oldest_entries_go_first() {
        let dir = tempfile::tempdir().unwrap();
        let old = write_entry(dir.path(), &key(1), 600, Duration::from_secs(3000));
        let mid = write_entry(dir.path(), &key(2), 600, Duration::from_secs(2000));
        let new = write_entry(dir.path(), &key(3), 600, Duration::from_secs(10));

        // 1800 bytes total, bound 1300: the two newest fit, the oldest goes.
        let cleaner = cleaner(dir.path(), 1300, None);
        assert_eq!(cleaner.sweep().await.unwrap(), 1);
        assert!(!old.exists());
        assert!(mid.exists());
        assert!(new.exists());
    }

    #[tokio::test]
    async fn recently_read_entry_survives() {
        let dir = tempfile::tempdir().unwrap();
        let touched = write_entry(dir.path(), &key(1), 600, Duration::from_secs(3000));
        let other = write_entry(dir.path(), &key(2), 600, Duration::from_secs(2000));
        // A hit refreshes the old entry's clock.
        crate::cache::store::touch(&touched).unwrap();

        let cleaner = cleaner(dir.path(), 700, None);
        assert_eq!(cleaner.sweep().await.unwrap(), 1);
        assert!(touched.exists());
        assert!(!other.exists());
    }

    #[tokio::test]
    async fn age_bound_expires_entries_regardless_of_size() {
        let dir = tempfile::tempdir().unwrap();
        let ancient = write_entry(dir.path(), &key(1), 10, Duration::from_secs(100_000));
        let fresh = write_entry(dir.path(), &key(2), 10, Duration::from_secs(10));

        let cleaner = cleaner(
            dir.path(),
            u64::MAX,
            Some(Duration::from_secs(50_000)),
        );
        assert_eq!(cleaner.sweep().await.unwrap(), 1);
        assert!(!ancient.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn locked_entry_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_entry(dir.path(), &key(1), 600, Duration::from_secs(3000));
        let held = try_lock_exclusive(&entry.with_extension("lock"))
            .unwrap()
            .unwrap();

        let cleaner = cleaner(dir.path(), 100, None);
        assert_eq!(cleaner.sweep().await.unwrap(), 0);
        assert!(entry.exists());
        drop(held);
    }

    #[tokio::test]
    async fn entry_with_readers_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let name = key(1);
        let entry = write_entry(dir.path(), &name, 600, Duration::from_secs(3000));

        let readers = ReaderRegistry::default();
        let _reader = readers.attach(&name);
        let cleaner = CacheCleaner::new(dir.path().to_path_buf(), 100, None, readers);
        assert_eq!(cleaner.sweep().await.unwrap(), 0);
        assert!(entry.exists());
    }

    #[tokio::test]
    async fn sweeps_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), &key(1), 600, Duration::from_secs(3000));
        write_entry(dir.path(), &key(2), 600, Duration::from_secs(10));

        let cleaner = cleaner(dir.path(), 700, None);
        assert_eq!(cleaner.sweep().await.unwrap(), 1);
        // Immediately after, the clean.lock mtime gates the next pass.
        write_entry(dir.path(), &key(3), 600, Duration::from_secs(3000));
        assert_eq!(cleaner.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tempfiles_are_not_eviction_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("{}.tmp", key(1));
        let tmp = write_entry(dir.path(), &name, 600, Duration::from_secs(3000));

        let cleaner = cleaner(dir.path(), 100, None);
        assert_eq!(cleaner.sweep().await.unwrap(), 0);
        assert!(tmp.exists());
    }

    #[test]
    fn stale_tmp_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let stale = write_entry(
            dir.path(),
            &format!("{}.tmp", key(1)),
            10,
            Duration::from_secs(7200),
        );
        let live = write_entry(
            dir.path(),
            &format!("{}.tmp", key(2)),
            10,
            Duration::from_secs(60),
        );
        let ready = write_entry(dir.path(), &key(3), 10, Duration::from_secs(7200));

        let cleaner = cleaner(dir.path(), u64::MAX, None);
        assert_eq!(cleaner.sweep_stale_tmp(TMP_GRACE).unwrap(), 1);
        assert!(!stale.exists());
        assert!(live.exists());
        assert!(ready.exists());
    }
}
