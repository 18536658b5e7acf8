//! Shared plumbing for the content-addressed cache trees.
//!
//! Both cache trees (`pack_cache/`, `lfs/`) hold entries at
//! `<root>/<key[0:2]>/<key>` with a sibling `<key>.lock` advisory lock file
//! and a `<key>.tmp` while an entry is being produced.  An entry becomes
//! ready only through an atomic rename of its tempfile; readers therefore
//! see either a complete entry or nothing.
//!
//! The filesystem is the single source of truth: every request re-checks
//! on disk, nothing about entry state is cached in memory.  The only
//! in-process state is the count of attached readers per key, consulted by
//! the producer cancellation policy and the eviction sweep.

use std::collections::HashMap;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::lock::{PathLockGuard, PathLocks};

/// Channel end that carries cache content to one HTTP client.  Sending an
/// `Err` aborts the client's response stream mid-body.
pub type ByteSink = mpsc::Sender<io::Result<Bytes>>;

/// Read/write chunk size for cache content.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// The sole client of a production disconnected; the build was abandoned.
/// Logged, never surfaced as a server error.
#[derive(Debug, thiserror::Error)]
#[error("production abandoned: sole client disconnected")]
pub struct ProductionAbandoned;

// ---------------------------------------------------------------------------
// Reader registry
// ---------------------------------------------------------------------------

/// In-process count of attached readers per cache key.
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    inner: Arc<Mutex<HashMap<String, usize>>>,
}

impl ReaderRegistry {
    pub fn attach(&self, key: &str) -> ReaderGuard {
        let mut map = self.inner.lock().expect("reader registry poisoned");
        *map.entry(key.to_string()).or_insert(0) += 1;
        ReaderGuard {
            key: key.to_string(),
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self, key: &str) -> usize {
        let map = self.inner.lock().expect("reader registry poisoned");
        map.get(key).copied().unwrap_or(0)
    }
}

pub struct ReaderGuard {
    key: String,
    inner: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let mut map = self.inner.lock().expect("reader registry poisoned");
        if let Some(count) = map.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EntryStore
// ---------------------------------------------------------------------------

/// How a producer reacts when its own client disconnects mid-build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLossPolicy {
    /// Abandon the build unless other readers are attached (pack builds:
    /// the subprocess is expensive and the result may never be asked for
    /// again).
    AbandonIfSole,
    /// Finish and install regardless (LFS downloads: the next client retry
    /// hits the installed entry).
    Finish,
}

/// One content-addressed cache tree.
#[derive(Clone)]
pub struct EntryStore {
    root: PathBuf,
    locks: PathLocks,
    lock_timeout: Duration,
    follow_timeout: Duration,
    client_loss: ClientLossPolicy,
    readers: ReaderRegistry,
}

/// Outcome of [`EntryStore::prepare`]: how this request will be satisfied.
pub enum Prepared {
    /// Entry is ready on disk; stream the opened file.
    Ready(tokio::fs::File),
    /// Another worker is producing; join its tempfile from offset 0.
    Follow,
    /// This request owns the build.  The key lock is held by the producer.
    Produce(Producer),
}

impl EntryStore {
    pub fn new(
        root: PathBuf,
        locks: PathLocks,
        lock_timeout: Duration,
        follow_timeout: Duration,
        client_loss: ClientLossPolicy,
    ) -> Self {
        Self {
            root,
            locks,
            lock_timeout,
            follow_timeout,
            client_loss,
            readers: ReaderRegistry::default(),
        }
    }

    pub fn readers(&self) -> &ReaderRegistry {
        &self.readers
    }

    /// `<root>/<key[0:2]>/<key>`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(key)
    }

    pub fn tmp_path(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(format!("{key}.tmp"))
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(format!("{key}.lock"))
    }

    /// Decide how to satisfy a request for `key`.
    ///
    /// Single-flight: when the entry is absent this acquires the key lock,
    /// re-checks under it (another worker may have produced or may still be
    /// producing), and only then hands out a [`Producer`].  Concurrent
    /// requests either ride the existing tempfile ([`Prepared::Follow`]) or
    /// block here on the lock and find the finished entry.
    pub async fn prepare(&self, key: &str) -> Result<Prepared> {
        if let Some(file) = self.open_ready(key).await? {
            return Ok(Prepared::Ready(file));
        }
        if path_exists(&self.tmp_path(key)).await {
            return Ok(Prepared::Follow);
        }

        let guard = self
            .locks
            .acquire(&self.lock_path(key), self.lock_timeout)
            .await?;

        // Re-check under the lock.
        if let Some(file) = self.open_ready(key).await? {
            return Ok(Prepared::Ready(file));
        }
        let tmp_path = self.tmp_path(key);
        if path_exists(&tmp_path).await {
            // We hold the key lock, so no live producer owns this tempfile;
            // it was left by a crashed worker.
            warn!(key, tmp = %tmp_path.display(), "removing stale tempfile");
            tokio::fs::remove_file(&tmp_path)
                .await
                .with_context(|| format!("failed to remove stale tempfile: {}", tmp_path.display()))?;
        }

        let file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create tempfile: {}", tmp_path.display()))?;

        Ok(Prepared::Produce(Producer {
            key: key.to_string(),
            final_path: self.entry_path(key),
            tmp_path,
            file: Some(file),
            written: 0,
            sink: None,
            readers: self.readers.clone(),
            client_loss: self.client_loss,
            _guard: guard,
            finished: false,
        }))
    }

    async fn open_ready(&self, key: &str) -> Result<Option<tokio::fs::File>> {
        match tokio::fs::File::open(self.entry_path(key)).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to open cache entry {key}")),
        }
    }

    /// Stream a ready entry to `sink` and refresh its mtime so the LRU
    /// sweep sees the access.  An unlinked-but-open entry streams fine.
    pub async fn stream_ready(&self, key: &str, mut file: tokio::fs::File, sink: ByteSink) -> Result<u64> {
        let _reader = self.readers.attach(key);
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .with_context(|| format!("failed to read cache entry {key}"))?;
            if n == 0 {
                break;
            }
            sent += n as u64;
            if sink.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                debug!(key, sent, "client disconnected while reading cache");
                break;
            }
        }
        if let Err(e) = touch(&self.entry_path(key)) {
            debug!(key, error = %e, "failed to touch cache entry");
        }
        Ok(sent)
    }

    /// Join a build in progress: replay the producer's tempfile from offset
    /// 0 into `sink` and keep following until the entry is renamed ready.
    pub async fn follow(&self, key: &str, sink: ByteSink) -> Result<u64> {
        let _reader = self.readers.attach(key);
        super::follow::follow(
            &self.tmp_path(key),
            &self.entry_path(key),
            sink,
            self.follow_timeout,
        )
        .await
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Exclusive owner of one entry build.
///
/// Bytes written are teed to the attached client sink (if any) and the
/// tempfile that followers read.  The entry appears atomically on
/// [`commit`](Producer::commit); any other exit unlinks the tempfile, which
/// is also what tells followers the build died.
pub struct Producer {
    key: String,
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    sink: Option<ByteSink>,
    readers: ReaderRegistry,
    client_loss: ClientLossPolicy,
    _guard: PathLockGuard,
    finished: bool,
}

impl Producer {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Attach the producing client's sink; bytes fan out to it as they are
    /// written.
    pub fn attach_sink(&mut self, sink: ByteSink) {
        self.sink = Some(sink);
    }

    /// Append a chunk to the tempfile and the attached client.
    ///
    /// Returns [`ProductionAbandoned`] when the sole client is gone and the
    /// policy says the build is not worth finishing.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self.file.as_mut().expect("write after finish");
        file.write_all(chunk)
            .await
            .with_context(|| format!("failed to write tempfile for {}", self.key))?;
        self.written += chunk.len() as u64;

        if let Some(sink) = &self.sink {
            if sink.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                self.sink = None;
                let attached = self.readers.count(&self.key);
                if attached == 0 && self.client_loss == ClientLossPolicy::AbandonIfSole {
                    return Err(ProductionAbandoned.into());
                }
                debug!(
                    key = %self.key,
                    attached,
                    "producing client disconnected, continuing build"
                );
            }
        }
        Ok(())
    }

    /// Durably install the entry: fsync, atomic rename, mtime touch.
    pub async fn commit(mut self) -> Result<u64> {
        let file = self.file.take().expect("commit after finish");
        file.sync_all()
            .await
            .with_context(|| format!("failed to sync tempfile for {}", self.key))?;
        drop(file);
        tokio::fs::rename(&self.tmp_path, &self.final_path)
            .await
            .with_context(|| format!("failed to install cache entry {}", self.key))?;
        if let Err(e) = touch(&self.final_path) {
            debug!(key = %self.key, error = %e, "failed to touch new entry");
        }
        self.finished = true;
        debug!(key = %self.key, bytes = self.written, "cache entry installed");
        Ok(self.written)
    }

    /// Tear the build down: close and unlink the tempfile.  Followers see
    /// the unlink and terminate their streams with an error.
    pub async fn abort(mut self) {
        self.file.take();
        match tokio::fs::remove_file(&self.tmp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(key = %self.key, error = %e, "failed to remove tempfile"),
        }
        self.finished = true;
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if !self.finished {
            // Producer dropped without commit/abort (error path unwound
            // past it); the tempfile must not outlive the key lock.
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

// ---------------------------------------------------------------------------
// mtime touch
// ---------------------------------------------------------------------------

/// Set a path's mtime to now.  LRU order tracks access, not creation.
pub fn touch(path: &Path) -> io::Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
    ];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set a path's mtime to an arbitrary point, for eviction tests.
#[cfg(test)]
pub(crate) fn set_mtime(path: &Path, when: std::time::SystemTime) {
    let secs = when
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
    let times = [
        libc::timespec {
            tv_sec: secs,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: secs,
            tv_nsec: 0,
        },
    ];
    unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0f2a7c1d00000000000000000000000000000000000000000000000000000000";

    fn store(dir: &Path) -> EntryStore {
        EntryStore::new(
            dir.to_path_buf(),
            PathLocks::new(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            ClientLossPolicy::AbandonIfSole,
        )
    }

    async fn drain(mut rx: mpsc::Receiver<io::Result<Bytes>>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[test]
    fn entry_layout_uses_two_level_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.entry_path(KEY), dir.path().join("0f").join(KEY));
        assert_eq!(
            store.tmp_path(KEY),
            dir.path().join("0f").join(format!("{KEY}.tmp"))
        );
        assert_eq!(
            store.lock_path(KEY),
            dir.path().join("0f").join(format!("{KEY}.lock"))
        );
    }

    #[tokio::test]
    async fn produce_then_hit_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let Prepared::Produce(mut producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce on first touch");
        };
        producer.write(b"hello ").await.unwrap();
        producer.write(b"pack").await.unwrap();
        assert_eq!(producer.commit().await.unwrap(), 10);

        let Prepared::Ready(file) = store.prepare(KEY).await.unwrap() else {
            panic!("expected ready after commit");
        };
        let (tx, rx) = mpsc::channel(4);
        let sent = store.stream_ready(KEY, file, tx).await.unwrap();
        assert_eq!(sent, 10);
        assert_eq!(drain(rx).await.unwrap(), b"hello pack");
    }

    #[tokio::test]
    async fn tempfile_never_visible_at_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let Prepared::Produce(mut producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce");
        };
        producer.write(b"partial").await.unwrap();
        assert!(!store.entry_path(KEY).exists());
        assert!(store.tmp_path(KEY).exists());
        producer.abort().await;
        assert!(!store.entry_path(KEY).exists());
        assert!(!store.tmp_path(KEY).exists());
    }

    #[tokio::test]
    async fn producer_fans_out_to_attached_sink() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let Prepared::Produce(mut producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce");
        };
        let (tx, rx) = mpsc::channel(4);
        producer.attach_sink(tx);
        producer.write(b"abc").await.unwrap();
        producer.write(b"def").await.unwrap();
        producer.commit().await.unwrap();
        assert_eq!(drain(rx).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn sole_client_loss_abandons_build() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let Prepared::Produce(mut producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce");
        };
        let (tx, rx) = mpsc::channel(4);
        producer.attach_sink(tx);
        drop(rx);
        let err = producer.write(b"abc").await.unwrap_err();
        assert!(err.downcast_ref::<ProductionAbandoned>().is_some());
        producer.abort().await;
        assert!(!store.tmp_path(KEY).exists());
    }

    #[tokio::test]
    async fn client_loss_with_reader_attached_continues() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let Prepared::Produce(mut producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce");
        };
        let _reader = store.readers().attach(KEY);
        let (tx, rx) = mpsc::channel(4);
        producer.attach_sink(tx);
        drop(rx);
        producer.write(b"abc").await.unwrap();
        producer.commit().await.unwrap();
        assert!(store.entry_path(KEY).exists());
    }

    #[tokio::test]
    async fn finish_policy_survives_client_loss() {
        let dir = tempfile::tempdir().unwrap();
        let store = EntryStore::new(
            dir.path().to_path_buf(),
            PathLocks::new(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            ClientLossPolicy::Finish,
        );

        let Prepared::Produce(mut producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce");
        };
        let (tx, rx) = mpsc::channel(4);
        producer.attach_sink(tx);
        drop(rx);
        producer.write(b"abc").await.unwrap();
        producer.commit().await.unwrap();
        assert!(store.entry_path(KEY).exists());
    }

    #[tokio::test]
    async fn concurrent_prepare_sees_follow() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let Prepared::Produce(producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce");
        };
        // While the tempfile exists a second prepare must not start a
        // second build.
        match store.prepare(KEY).await.unwrap() {
            Prepared::Follow => {}
            Prepared::Ready(_) => panic!("entry should not be ready"),
            Prepared::Produce(_) => panic!("second build started during production"),
        }
        producer.abort().await;
    }

    #[tokio::test]
    async fn dropped_producer_cleans_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let Prepared::Produce(mut producer) = store.prepare(KEY).await.unwrap() else {
            panic!("expected produce");
        };
        producer.write(b"abc").await.unwrap();
        drop(producer);
        assert!(!store.tmp_path(KEY).exists());

        // The key is produceable again.
        match store.prepare(KEY).await.unwrap() {
            Prepared::Produce(p) => p.abort().await,
            _ => panic!("expected produce after cleanup"),
        }
    }

    #[tokio::test]
    async fn touch_moves_mtime_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        std::fs::write(&path, b"x").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&path, old);
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        touch(&path).unwrap();
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn reader_registry_counts() {
        let registry = ReaderRegistry::default();
        assert_eq!(registry.count(KEY), 0);
        let a = registry.attach(KEY);
        let b = registry.attach(KEY);
        assert_eq!(registry.count(KEY), 2);
        drop(a);
        assert_eq!(registry.count(KEY), 1);
        drop(b);
        assert_eq!(registry.count(KEY), 0);
    }
}
